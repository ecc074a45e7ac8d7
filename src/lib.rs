//! yaacc: Avaya CDR collector.
//!
//! Accepts fixed-width CDR streams from PBXs over TCP, decodes each line,
//! persists it and keeps per-source Prometheus counters. See
//! [`bootstrap::Server`] for how the pieces are wired.

pub mod bootstrap;
pub mod cdr;
pub mod config;
pub mod listener;
pub mod pipeline;
pub mod store;
pub mod telemetry;
