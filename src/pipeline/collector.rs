//! Metrics collector - feeds decoded CDRs into the counter set.
//!
//! Consumes: metricsQ

use std::sync::Arc;

use tracing::debug;

use crate::bootstrap::{terminated, ShutdownManager};
use crate::cdr::Cdr;
use crate::telemetry::CdrMetrics;

use super::PipelineError;

/// Single consumer of metricsQ.
pub struct MetricsCollector {
    input: flume::Receiver<Arc<Cdr>>,
    metrics: Arc<CdrMetrics>,
    shutdown: Arc<ShutdownManager>,
}

impl MetricsCollector {
    pub fn new(
        input: flume::Receiver<Arc<Cdr>>,
        metrics: Arc<CdrMetrics>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self {
            input,
            metrics,
            shutdown,
        }
    }

    /// Drain metricsQ until it closes.
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut observed: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = terminated(&mut shutdown_rx) => return Err(PipelineError::Cancelled),

                cdr = self.input.recv_async() => match cdr {
                    Ok(cdr) => {
                        self.metrics.observe(&cdr);
                        observed += 1;
                    }
                    Err(_) => break,
                },
            }
        }

        debug!(observed, "metrics collector stopped");
        Ok(())
    }
}
