//! Storage worker - hands CDRs to the store one at a time.
//!
//! Consumes: saveQ

use std::sync::Arc;

use tracing::{debug, error};

use crate::bootstrap::{terminated, ShutdownManager};
use crate::cdr::Cdr;
use crate::config::StoreErrorPolicy;
use crate::store::SharedStore;
use crate::telemetry::CdrMetrics;

use super::PipelineError;

/// One member of the storage pool.
pub struct StorageWorker {
    id: usize,
    input: flume::Receiver<Arc<Cdr>>,
    store: SharedStore,
    policy: StoreErrorPolicy,
    metrics: Arc<CdrMetrics>,
    shutdown: Arc<ShutdownManager>,
}

impl StorageWorker {
    pub fn new(
        id: usize,
        input: flume::Receiver<Arc<Cdr>>,
        store: SharedStore,
        policy: StoreErrorPolicy,
        metrics: Arc<CdrMetrics>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self {
            id,
            input,
            store,
            policy,
            metrics,
            shutdown,
        }
    }

    /// Drain saveQ until it closes.
    ///
    /// Under [`StoreErrorPolicy::Fail`] the first store error is returned;
    /// under [`StoreErrorPolicy::Drop`] the record is counted and skipped.
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let cdr = tokio::select! {
                biased;

                _ = terminated(&mut shutdown_rx) => return Err(PipelineError::Cancelled),

                cdr = self.input.recv_async() => match cdr {
                    Ok(cdr) => cdr,
                    Err(_) => break,
                },
            };

            let result = tokio::select! {
                biased;

                _ = terminated(&mut shutdown_rx) => return Err(PipelineError::Cancelled),

                result = self.store.persist(&cdr) => result,
            };

            if let Err(e) = result {
                self.metrics.store_error(&cdr.source);
                error!(
                    worker = self.id,
                    store = self.store.name(),
                    source = %cdr.source,
                    error = %e,
                    "CDR not inserted"
                );

                match self.policy {
                    StoreErrorPolicy::Fail => return Err(e.into()),
                    StoreErrorPolicy::Drop => continue,
                }
            }
        }

        debug!(worker = self.id, "storage worker stopped");
        Ok(())
    }
}
