use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use std::path::Path;
use tracing::debug;

use super::types::Config;
use crate::cdr::LINE_LENGTH;
use crate::store::Driver;

/// Prefix of environment overrides, e.g. `YAACC_DATABASE__HOST`.
pub const ENV_PREFIX: &str = "YAACC_";

impl Config {
    /// Load configuration from a YAML file, then apply `YAACC_*`
    /// environment overrides. Nested keys are separated by `__`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        if !path.is_file() {
            bail!("config file not found: {}", path.display());
        }

        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Parse configuration from a YAML string. No environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cdr_address.as_str().is_empty() {
            bail!("cdr_address must not be empty");
        }
        if self.metrics_address.as_str().is_empty() {
            bail!("metrics_address must not be empty");
        }

        Driver::parse(&self.database.driver)?;

        if !is_identifier(&self.database.table) {
            bail!("invalid table name: {:?}", self.database.table);
        }
        if self.database.max_connections == 0 {
            bail!("database.max_connections must be at least 1");
        }

        let pipeline = &self.pipeline;
        if pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be at least 1");
        }
        if pipeline.drain_timeout.is_zero() {
            bail!("pipeline.drain_timeout must be positive");
        }
        if pipeline.max_line_length < LINE_LENGTH {
            bail!(
                "pipeline.max_line_length must be at least {} (got {})",
                LINE_LENGTH,
                pipeline.max_line_length
            );
        }

        self.decoder.zone().with_context(|| {
            format!(
                "invalid decoder.utc_offset: {:?}",
                self.decoder.utc_offset.as_deref().unwrap_or_default()
            )
        })?;

        let rate = self.telemetry.trace_sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            bail!("telemetry.trace_sample_rate must be within [0, 1] (got {rate})");
        }

        debug!("configuration validated successfully");
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreErrorPolicy;
    use figment::Jail;
    use std::time::Duration;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.cdr_address.as_str(), "[::]:5013");
        assert_eq!(config.metrics_address.as_str(), "[::]:9013");
        assert_eq!(config.database.driver, "pg");
        assert_eq!(config.database.table, "avaya_cdr");
        assert_eq!(config.pipeline.queue_capacity, 5);
        assert_eq!(config.pipeline.on_store_error, StoreErrorPolicy::Fail);
        assert!(config.failcdr.is_none());
        assert!(config.logfile.is_none());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
cdr_address: "127.0.0.1:6000"
metrics_address: ":9100"
failcdr: /var/lib/yaacc/failed.jsonl
database:
  driver: postgresql
  host: db.local
  port: 6432
  name: telephony
  user: yaacc
  password: secret
  table: cdr_2024
  connect_timeout: 3s
pipeline:
  queue_capacity: 50
  workers: 2
  overflow_warning: 250ms
  on_store_error: drop
  drain_timeout: 1m
decoder:
  utc_offset: "+03:00"
telemetry:
  log_level: debug
  json_logs: true
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.cdr_address.as_str(), "127.0.0.1:6000");
        assert_eq!(config.metrics_address.as_str(), "[::]:9100");
        assert_eq!(config.database.port, 6432);
        assert_eq!(config.database.table, "cdr_2024");
        assert_eq!(config.database.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.pipeline.worker_count(), 2);
        assert_eq!(config.pipeline.overflow_warning, Duration::from_millis(250));
        assert_eq!(config.pipeline.on_store_error, StoreErrorPolicy::Drop);
        assert_eq!(config.pipeline.drain_timeout, Duration::from_secs(60));
        assert!(config.telemetry.json_logs);
        assert!(!format!("{:?}", config.database).contains("secret"));
    }

    #[test]
    fn test_worker_count_floor() {
        let config = Config::from_yaml("{}").unwrap();
        assert!(config.pipeline.worker_count() >= 4);
    }

    #[test]
    fn test_unknown_driver() {
        let yaml = "database:\n  driver: mysql\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("mysql"));
    }

    #[test]
    fn test_invalid_table_name() {
        for table in ["1cdr", "cdr; drop table x", "", "cdr-log"] {
            let yaml = format!("database:\n  table: {table:?}\n");
            assert!(Config::from_yaml(&yaml).is_err(), "{table:?} accepted");
        }
        assert!(is_identifier("_cdr_01"));
    }

    #[test]
    fn test_zero_queue_capacity() {
        let err = Config::from_yaml("pipeline:\n  queue_capacity: 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_short_max_line_length() {
        let err = Config::from_yaml("pipeline:\n  max_line_length: 80\n").unwrap_err();
        assert!(err.to_string().contains("max_line_length"));
    }

    #[test]
    fn test_invalid_utc_offset() {
        let err = Config::from_yaml("decoder:\n  utc_offset: moscow\n").unwrap_err();
        assert!(err.to_string().contains("utc_offset"));
    }

    #[test]
    fn test_invalid_sample_rate() {
        assert!(Config::from_yaml("telemetry:\n  trace_sample_rate: 1.5\n").is_err());
    }

    #[test]
    fn test_bad_duration() {
        assert!(Config::from_yaml("pipeline:\n  drain_timeout: soon\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load("/nonexistent/yaacc.yaml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "yaacc.yaml",
                r#"
cdr_address: ":5013"
database:
  driver: memory
  host: file-host
"#,
            )?;
            jail.set_env("YAACC_DATABASE__HOST", "env-host");
            jail.set_env("YAACC_CDR_ADDRESS", "127.0.0.1:7000");
            jail.set_env("YAACC_PIPELINE__QUEUE_CAPACITY", "42");

            let config = Config::load("yaacc.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config.database.host, "env-host");
            assert_eq!(config.database.driver, "memory");
            assert_eq!(config.cdr_address.as_str(), "127.0.0.1:7000");
            assert_eq!(config.pipeline.queue_capacity, 42);
            Ok(())
        });
    }

    #[test]
    fn test_numeric_env_values_for_text_keys() {
        Jail::expect_with(|jail| {
            jail.create_file("yaacc.yaml", "database:\n  driver: memory\n")?;
            jail.set_env("YAACC_DATABASE__PASSWORD", "1234");
            jail.set_env("YAACC_DATABASE__USER", "1001");
            jail.set_env("YAACC_DATABASE__NAME", "2024");

            let config = Config::load("yaacc.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config.database.password, "1234");
            assert_eq!(config.database.user, "1001");
            assert_eq!(config.database.name, "2024");
            Ok(())
        });
    }

    #[test]
    fn test_numeric_yaml_values_for_text_keys() {
        let yaml = "database:\n  password: 0042\n  host: 10\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.database.host, "10");
        assert!(!config.database.password.is_empty());
    }

    #[test]
    fn test_env_override_is_validated() {
        Jail::expect_with(|jail| {
            jail.create_file("yaacc.yaml", "database:\n  driver: memory\n")?;
            jail.set_env("YAACC_PIPELINE__QUEUE_CAPACITY", "0");

            assert!(Config::load("yaacc.yaml").is_err());
            Ok(())
        });
    }
}
