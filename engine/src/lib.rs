//! # Ingest Engine - Verified File Transfer Library
//!
//! A headless engine for copying media off cameras, card readers and network
//! shares without ever leaving a partial or corrupt file behind.
//! Designed as the foundation for multiple front ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! - Atomic per-file copies: stream to a temp file, hash, verify, rename
//! - Bounded-concurrency batches with results aligned to task order
//! - Retry with exponential backoff for transient failures
//! - Cooperative cancellation down to the chunk boundary
//! - Size-tiered progress throttling, reported through an observer trait
//! - A closed error taxonomy with a fixed retryable bit per kind
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{EngineConfig, TransferEngine};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::new(EngineConfig::default());
//!
//! // Plan one task per file on the card
//! let tasks = engine.plan_directory(Path::new("/media/CARD/DCIM"), Path::new("/archive/shoot"))?;
//! println!("Will copy {} files", tasks.len());
//!
//! // Run them
//! let queue = engine.queue(tasks);
//! let report = engine.run(&queue, None)?;
//!
//! let summary = report.summary();
//! println!("{} copied, {} verified", summary.succeeded, summary.verified);
//! for error in &report.errors {
//!     println!("{}: {}", error.source_path.display(), error.message);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Tasks, per-file results, batch summaries
//! - **error**: Error taxonomy and I/O error classification
//! - **cancel**: Shared cancellation token
//! - **checksums**: Streaming checksums (CRC32, MD5, SHA-256, BLAKE3)
//! - **progress**: Throttled progress tracking and the observer trait
//! - **fs_ops**: Low-level filesystem operations
//! - **copier**: Atomic copy-and-verify of one file
//! - **retry**: Exponential backoff
//! - **queue**: Bounded-concurrency batch execution
//! - **config**: Engine configuration
//! - **job**: The engine facade and batch reports

pub mod model;
pub mod error;
pub mod cancel;
pub mod checksums;
pub mod progress;
pub mod fs_ops;
pub mod copier;
pub mod retry;
pub mod queue;
pub mod config;
pub mod job;

// Re-export main types and functions
pub use model::{BatchSummary, FileTransferResult, TransferTask};
pub use error::{classify_io_error, ErrorKind, Side, TransferError};
pub use cancel::CancelToken;
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumStream, ChecksumValue};
pub use progress::{ProgressSample, ProgressTracker, TransferObserver};
pub use copier::{CopyOptions, FileCopier};
pub use retry::RetryStrategy;
pub use queue::{QueueConfig, QueueError, TaskContext, TaskError, TaskRunner, TransferQueue};
pub use config::EngineConfig;
pub use job::{BatchOutcome, BatchReport, CopyRunner, TransferEngine};
