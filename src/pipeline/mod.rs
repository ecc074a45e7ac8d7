//! Staged CDR processing pipeline.
//!
//! ```text
//! PBX --TCP--> Receiver --LineMessage--> inputQ
//!                                          |
//!                                    DecoderWorker xN
//!                                     /           \
//!                                 saveQ        metricsQ
//!                                   |              |
//!                          StorageWorker xN   MetricsCollector
//! ```
//!
//! Queues are bounded `flume` channels. A queue closes when its last
//! sender is dropped: inputQ once the receiver and every connection
//! handler are gone, saveQ and metricsQ once every decoder worker has
//! returned. Consumers drain until their queue closes and only stop early
//! on the hard stop.

mod collector;
mod decoder;
mod queue;
mod storage;

pub use collector::MetricsCollector;
pub use decoder::DecoderWorker;
pub use queue::{
    bounded, send_with_warning, FanOut, Queue, INPUT_QUEUE, METRICS_QUEUE, SAVE_QUEUE,
};
pub use storage::StorageWorker;

use thiserror::Error;

use crate::store::StoreError;

/// Worker errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Hard stop requested. Not a failure.
    #[error("cancelled")]
    Cancelled,

    #[error("{0} queue closed")]
    QueueClosed(&'static str),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
