//! Failed-record spill file.
//!
//! Lines the decoder rejects are appended as JSON objects, one per line,
//! so they can be inspected and replayed by hand.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

/// Spill file errors.
#[derive(Debug, Error)]
pub enum SpillError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One rejected line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub received_at: DateTime<Utc>,
    pub source: String,
    pub error: String,
    pub line: String,
}

/// Append-only JSON lines file shared by all decoder workers.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    file: Mutex<File>,
    records: AtomicU64,
}

impl SpillFile {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SpillError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SpillError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| SpillError::Io {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "opened failed CDR file");

        Ok(Self {
            path,
            file: Mutex::new(file),
            records: AtomicU64::new(0),
        })
    }

    /// Append one rejected line.
    pub async fn append(
        &self,
        source: &str,
        line: &str,
        error: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), SpillError> {
        let record = FailedRecord {
            received_at: Utc::now(),
            source: source.to_string(),
            error: error.to_string(),
            line: line.to_string(),
        };
        let mut json = serde_json::to_vec(&record)?;
        json.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&json).await.map_err(|source| self.io(source))?;
        file.flush().await.map_err(|source| self.io(source))?;
        drop(file);

        self.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records appended since open.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    fn io(&self, source: std::io::Error) -> SpillError {
        SpillError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::DecodeError;

    #[tokio::test]
    async fn test_append_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed").join("cdr.jsonl");

        let spill = SpillFile::open(&path).await.unwrap();
        spill
            .append("10.0.0.5", "short", &DecodeError::IncorrectLength(5))
            .await
            .unwrap();
        spill
            .append("10.0.0.6", "", &DecodeError::IncorrectLength(0))
            .await
            .unwrap();
        assert_eq!(spill.records(), 2);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<FailedRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, "10.0.0.5");
        assert_eq!(records[0].line, "short");
        assert_eq!(records[0].error, "incorrect line length(5)");
        assert_eq!(records[1].source, "10.0.0.6");
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdr.jsonl");

        for _ in 0..2 {
            let spill = SpillFile::open(&path).await.unwrap();
            spill
                .append("10.0.0.5", "x", &DecodeError::NonAscii)
                .await
                .unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
