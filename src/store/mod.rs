//! CDR storage.
//!
//! The pipeline only ever calls [`CdrStore::persist`] and [`CdrStore::close`];
//! schema creation happens once at startup through
//! [`CdrStore::create_table`].
//!
//! # Implementations
//!
//! - [`PostgresStore`]: PostgreSQL via a `sqlx` connection pool
//! - [`MemoryStore`]: bounded in-memory ring for tests and dry runs

mod factory;
mod memory;
mod postgres;

pub use factory::{create_store, Driver};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cdr::Cdr;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("create table {table}: {reason}")]
    CreateTable { table: String, reason: String },

    #[error("insert failed: {0}")]
    Insert(String),

    #[error("expected 1 row affected, got {0}")]
    RowsAffected(u64),

    #[error("invalid database driver: {0}")]
    InvalidDriver(String),

    #[error("store is closed")]
    Closed,
}

/// Capability the pipeline needs from a storage engine.
#[async_trait]
pub trait CdrStore: Send + Sync {
    /// Driver name for logging.
    fn name(&self) -> &'static str;

    /// Create the target table and its indexes if missing.
    async fn create_table(&self) -> Result<(), StoreError>;

    /// Durably accept one record.
    async fn persist(&self, cdr: &Cdr) -> Result<(), StoreError>;

    /// Release connections. Later calls to `persist` fail with
    /// [`StoreError::Closed`].
    async fn close(&self);
}

/// Shared store handle.
pub type SharedStore = Arc<dyn CdrStore>;
