//! Core data model for transfers.
//!
//! This module defines the shapes the engine consumes and produces:
//! - TransferTask: one (source, destination) pair, placed by its index
//! - FileTransferResult: the single terminal outcome of a task
//! - BatchSummary: counts derived from a batch's results

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checksums::ChecksumValue;
use crate::error::{ErrorKind, TransferError};

/// A single file to transfer.
///
/// `index` is the task's slot in the batch result vector. Tasks are handed
/// out by shared reference once submitted and never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub index: usize,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Size the caller saw when planning; the copy fails if the source
    /// yields a different number of bytes.
    pub expected_size: Option<u64>,
}

impl TransferTask {
    /// Create a new task with no expected size
    pub fn new(index: usize, source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        TransferTask {
            index,
            source: source.into(),
            destination: destination.into(),
            expected_size: None,
        }
    }

    /// Set the size the source is expected to have
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

/// Terminal outcome of one file transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferResult {
    pub success: bool,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub bytes_transferred: u64,
    /// Hash of the source bytes as they were streamed
    pub checksum: Option<ChecksumValue>,
    /// True only if the written file was re-read and matched `checksum`
    pub checksum_verified: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl FileTransferResult {
    pub(crate) fn succeeded(
        source: &Path,
        destination: &Path,
        bytes_transferred: u64,
        checksum: ChecksumValue,
        checksum_verified: bool,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        FileTransferResult {
            success: true,
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            bytes_transferred,
            checksum: Some(checksum),
            checksum_verified,
            error: None,
            error_kind: None,
            duration_ms: duration_millis(duration),
            started_at,
        }
    }

    /// Build the failure (or cancellation) result for `task`.
    ///
    /// Nothing is ever left at the destination on failure, so
    /// `bytes_transferred` is always zero here.
    pub fn failed(
        task: &TransferTask,
        error: &TransferError,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        FileTransferResult {
            success: false,
            source_path: task.source.clone(),
            destination_path: task.destination.clone(),
            bytes_transferred: 0,
            checksum: None,
            checksum_verified: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            duration_ms: duration_millis(duration),
            started_at,
        }
    }

    /// Returns true if the transfer was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Counts over a batch's result slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub verified: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Slots with no result: never started, or failed under continue-on-error
    pub empty: usize,
    pub bytes_transferred: u64,
}

impl BatchSummary {
    pub fn from_results(results: &[Option<FileTransferResult>]) -> Self {
        let mut summary = BatchSummary {
            total: results.len(),
            ..Default::default()
        };
        for slot in results {
            match slot {
                None => summary.empty += 1,
                Some(r) if r.success => {
                    summary.succeeded += 1;
                    summary.bytes_transferred += r.bytes_transferred;
                    if r.checksum_verified {
                        summary.verified += 1;
                    }
                }
                Some(r) if r.is_cancelled() => summary.cancelled += 1,
                Some(_) => summary.failed += 1,
            }
        }
        summary
    }
}
