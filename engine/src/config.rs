//! Engine configuration.
//!
//! Callers build an [`EngineConfig`] (the CLI does it from flags) and hand it
//! to [`crate::TransferEngine::new`], which normalizes it once. Values outside
//! their accepted range fall back to the default instead of being rejected.

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::copier::{CopyOptions, DEFAULT_BUFFER_SIZE};
use crate::queue::{normalize_concurrency, QueueConfig, DEFAULT_CONCURRENCY};
use crate::retry::RetryStrategy;

pub const MIN_BUFFER_SIZE: usize = 4 * 1024;
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parallel copies, 1..=10
    pub concurrency_limit: usize,
    /// Bytes per read/write chunk, 4 KiB..=64 MiB
    pub buffer_size: usize,
    pub verify_checksum: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub overwrite: bool,
    pub preserve_mtime: bool,
    pub continue_on_error: bool,
    pub retry: RetryStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            concurrency_limit: DEFAULT_CONCURRENCY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            verify_checksum: true,
            checksum_algorithm: ChecksumAlgorithm::default(),
            overwrite: false,
            preserve_mtime: true,
            continue_on_error: false,
            retry: RetryStrategy::default(),
        }
    }
}

impl EngineConfig {
    /// Replace out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        self.concurrency_limit = normalize_concurrency(self.concurrency_limit);
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        self
    }

    /// Get the per-file copy options
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            buffer_size: self.buffer_size,
            verify_checksum: self.verify_checksum,
            overwrite: self.overwrite,
            algorithm: self.checksum_algorithm,
            preserve_mtime: self.preserve_mtime,
        }
    }

    /// Get the queue settings
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency_limit: self.concurrency_limit,
            continue_on_error: self.continue_on_error,
        }
    }
}
