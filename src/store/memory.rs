//! In-memory storage implementation.
//!
//! Volatile storage for tests and dry runs. Keeps the most recent records
//! in a bounded ring; all data is lost on restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::cdr::Cdr;

use super::{CdrStore, StoreError};

/// Default ring capacity.
const DEFAULT_CAPACITY: usize = 100_000;

/// In-memory CDR store.
#[derive(Debug)]
pub struct MemoryStore {
    records: Mutex<VecDeque<Cdr>>,
    capacity: usize,
    persisted: AtomicU64,
    attempts: AtomicU64,
    fail_after: Option<u64>,
    latency: Option<Duration>,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Keep at most `capacity` records; older ones are evicted.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            persisted: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            fail_after: None,
            latency: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Accept `n` records, then fail every later `persist`.
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Delay every `persist` by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Records accepted since creation, including evicted ones.
    pub fn count(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Up to `limit` most recent records, newest last.
    pub fn recent(&self, limit: usize) -> Vec<Cdr> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// Retained records from `source`, oldest first.
    pub fn by_source(&self, source: &str) -> Vec<Cdr> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|cdr| cdr.source == source)
            .cloned()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CdrStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_table(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn persist(&self, cdr: &Cdr) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.fail_after.is_some_and(|n| attempt >= n) {
            return Err(StoreError::Insert("injected failure".to_string()));
        }

        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(cdr.clone());
        }
        self.persisted.fetch_add(1, Ordering::Relaxed);

        debug!(source = %cdr.source, "CDR stored in memory");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
