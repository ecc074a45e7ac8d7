//! Bounded queues and the decoder fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::warn;

use crate::bootstrap::{terminated, ShutdownState};
use crate::cdr::Cdr;

use super::PipelineError;

/// Queue names used in logs.
pub const INPUT_QUEUE: &str = "input";
pub const SAVE_QUEUE: &str = "save";
pub const METRICS_QUEUE: &str = "metrics";

/// Both ends of a bounded MPMC queue.
pub struct Queue<T> {
    pub tx: flume::Sender<T>,
    pub rx: flume::Receiver<T>,
}

/// Create a bounded queue. A capacity of 0 is raised to 1.
pub fn bounded<T>(capacity: usize) -> Queue<T> {
    let (tx, rx) = flume::bounded(capacity.max(1));
    Queue { tx, rx }
}

/// Send `item`, blocking while the queue is full.
///
/// Logs a "channel overflowing" warning once the wait crosses
/// `warn_after`, then keeps waiting. Only the hard stop abandons the send.
pub async fn send_with_warning<T>(
    tx: &flume::Sender<T>,
    item: T,
    queue: &'static str,
    warn_after: Duration,
    shutdown: &mut watch::Receiver<ShutdownState>,
) -> Result<(), PipelineError> {
    let started = Instant::now();
    let send = tx.send_async(item);
    tokio::pin!(send);
    let warning = tokio::time::sleep(warn_after);
    tokio::pin!(warning);
    let mut warned = false;

    loop {
        tokio::select! {
            biased;

            _ = terminated(shutdown) => return Err(PipelineError::Cancelled),

            result = &mut send => {
                return result.map_err(|_| PipelineError::QueueClosed(queue));
            }

            _ = &mut warning, if !warned => {
                warned = true;
                warn!(
                    queue,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "channel overflowing"
                );
            }
        }
    }
}

/// Decoder output: every CDR goes to saveQ, then to metricsQ.
#[derive(Clone)]
pub struct FanOut {
    save: flume::Sender<Arc<Cdr>>,
    metrics: flume::Sender<Arc<Cdr>>,
    warn_after: Duration,
}

impl FanOut {
    pub fn new(
        save: flume::Sender<Arc<Cdr>>,
        metrics: flume::Sender<Arc<Cdr>>,
        warn_after: Duration,
    ) -> Self {
        Self {
            save,
            metrics,
            warn_after,
        }
    }

    /// Deliver to both sinks. Persistence goes first so metrics never run
    /// ahead of storage.
    pub async fn send(
        &self,
        cdr: Arc<Cdr>,
        shutdown: &mut watch::Receiver<ShutdownState>,
    ) -> Result<(), PipelineError> {
        send_with_warning(&self.save, cdr.clone(), SAVE_QUEUE, self.warn_after, shutdown).await?;
        send_with_warning(&self.metrics, cdr, METRICS_QUEUE, self.warn_after, shutdown).await
    }
}
