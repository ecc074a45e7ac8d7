use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::cdr::CallZone;

/// Root configuration for yaacc
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ingest (PBX) bind address
    pub cdr_address: ListenAddress,

    /// Prometheus endpoint bind address
    pub metrics_address: ListenAddress,

    /// Storage driver and connection
    pub database: DatabaseConfig,

    /// Append logs here instead of stdout
    pub logfile: Option<PathBuf>,

    /// Failed-record spill file
    pub failcdr: Option<PathBuf>,

    pub pipeline: PipelineConfig,

    pub decoder: DecoderConfig,

    pub telemetry: TelemetryConfig,

    pub metrics: MetricsEndpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cdr_address: ListenAddress::from(":5013"),
            metrics_address: ListenAddress::from(":9013"),
            database: DatabaseConfig::default(),
            logfile: None,
            failcdr: None,
            pipeline: PipelineConfig::default(),
            decoder: DecoderConfig::default(),
            telemetry: TelemetryConfig::default(),
            metrics: MetricsEndpointConfig::default(),
        }
    }
}

/// TCP bind address. `:port` means all interfaces, IPv6 and IPv4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress(String);

impl<'de> Deserialize<'de> for ListenAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        scalar::string(deserializer).map(ListenAddress::from)
    }
}

impl ListenAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ListenAddress {
    fn from(address: String) -> Self {
        let address = address.trim();
        if address.starts_with(':') {
            ListenAddress(format!("[::]{address}"))
        } else {
            ListenAddress(address.to_string())
        }
    }
}

impl From<&str> for ListenAddress {
    fn from(address: &str) -> Self {
        Self::from(address.to_string())
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `pg`, `pgsql`, `postgresql` or `memory`
    #[serde(default = "default_driver", deserialize_with = "scalar::string")]
    pub driver: String,

    #[serde(default = "default_db_host", deserialize_with = "scalar::string")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database name
    #[serde(default = "default_db_name", deserialize_with = "scalar::string")]
    pub name: String,

    #[serde(default = "default_db_user", deserialize_with = "scalar::string")]
    pub user: String,

    #[serde(default, deserialize_with = "scalar::string")]
    pub password: String,

    /// Target table
    #[serde(default = "default_table", deserialize_with = "scalar::string")]
    pub table: String,

    /// Pool size
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            user: default_db_user(),
            password: String::new(),
            table: default_table(),
            max_connections: default_pool_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

// Keeps the password out of logs
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("table", &self.table)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

fn default_driver() -> String {
    "pg".to_string()
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "postgres".to_string()
}

fn default_db_user() -> String {
    "cdr".to_string()
}

fn default_table() -> String {
    "avaya_cdr".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// What a storage worker does when `persist` fails
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreErrorPolicy {
    /// Return the error and shut the pipeline down
    #[default]
    Fail,
    /// Log, count and continue (the record is lost)
    Drop,
}

/// Pipeline sizing and shutdown
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of inputQ, saveQ and metricsQ
    pub queue_capacity: usize,

    /// Decoder and storage pool size; 0 means max(4, cpu count)
    pub workers: usize,

    /// Blocked send time before "channel overflowing" is logged
    #[serde(with = "humantime_serde")]
    pub overflow_warning: Duration,

    pub on_store_error: StoreErrorPolicy,

    /// Graceful drain bound before the hard stop
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Longest accepted line in bytes
    pub max_line_length: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            workers: 0,
            overflow_warning: Duration::from_secs(1),
            on_store_error: StoreErrorPolicy::Fail,
            drain_timeout: Duration::from_secs(30),
            max_line_length: 8192,
        }
    }
}

impl PipelineConfig {
    /// Effective pool size.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(4)
        } else {
            self.workers
        }
    }
}

/// Decoder configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Fixed offset of the PBX clock, e.g. `+03:00`; absent means local
    #[serde(default, deserialize_with = "scalar::option_string")]
    pub utc_offset: Option<String>,
}

impl DecoderConfig {
    pub fn zone(&self) -> Result<CallZone, chrono::ParseError> {
        match &self.utc_offset {
            Some(offset) => offset.parse(),
            None => Ok(CallZone::Local),
        }
    }
}

/// Logging and trace export
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    #[serde(deserialize_with = "scalar::string")]
    pub log_level: String,

    pub json_logs: bool,

    /// OTLP gRPC endpoint; enables span export
    #[serde(default, deserialize_with = "scalar::option_string")]
    pub otlp_endpoint: Option<String>,

    pub trace_sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
            trace_sample_rate: 1.0,
        }
    }
}

/// Metrics HTTP endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsEndpointConfig {
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Text keys that also take bare numbers and booleans.
///
/// Environment overrides arrive typed (`YAACC_DATABASE__PASSWORD=1234` is
/// an integer), so string fields go through here.
mod scalar {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
        Bool(bool),
    }

    impl From<Scalar> for String {
        fn from(value: Scalar) -> Self {
            match value {
                Scalar::Text(s) => s,
                Scalar::Signed(n) => n.to_string(),
                Scalar::Unsigned(n) => n.to_string(),
                Scalar::Float(n) => n.to_string(),
                Scalar::Bool(b) => b.to_string(),
            }
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Scalar::deserialize(deserializer).map(String::from)
    }

    pub fn option_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(Option::<Scalar>::deserialize(deserializer)?.map(String::from))
    }
}
