//! Storage factory for creating storage backends.

use std::sync::Arc;

use crate::config::DatabaseConfig;

use super::{MemoryStore, PostgresStore, SharedStore, StoreError};

/// Storage drivers known to the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Postgres,
    Memory,
}

impl Driver {
    /// Resolve a configured driver name.
    pub fn parse(name: &str) -> Result<Self, StoreError> {
        match name.to_ascii_lowercase().as_str() {
            "pg" | "pgsql" | "postgresql" => Ok(Driver::Postgres),
            "memory" => Ok(Driver::Memory),
            _ => Err(StoreError::InvalidDriver(name.to_string())),
        }
    }
}

/// Create a storage backend based on configuration.
///
/// Connects but does not create the table; the supervisor does that so a
/// schema failure is reported as a startup failure.
pub async fn create_store(config: &DatabaseConfig) -> Result<SharedStore, StoreError> {
    match Driver::parse(&config.driver)? {
        Driver::Memory => {
            tracing::info!("using in-memory storage (volatile)");
            Ok(Arc::new(MemoryStore::new()))
        }
        Driver::Postgres => Ok(Arc::new(PostgresStore::connect(config).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_aliases() {
        for name in ["pg", "pgsql", "postgresql", "PostgreSQL"] {
            assert_eq!(Driver::parse(name).unwrap(), Driver::Postgres);
        }
        assert_eq!(Driver::parse("memory").unwrap(), Driver::Memory);
    }

    #[test]
    fn test_unknown_driver() {
        let err = Driver::parse("mysql").unwrap_err();
        assert!(matches!(err, StoreError::InvalidDriver(ref d) if d == "mysql"));
    }

    #[tokio::test]
    async fn test_create_memory_store() {
        let config = DatabaseConfig {
            driver: "memory".to_string(),
            ..Default::default()
        };
        let store = create_store(&config).await.unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test]
    async fn test_create_unknown_store() {
        let config = DatabaseConfig {
            driver: "oracle".to_string(),
            ..Default::default()
        };
        assert!(create_store(&config).await.is_err());
    }
}
