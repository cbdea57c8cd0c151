//! Batch orchestration.
//!
//! [`TransferEngine`] ties the pieces together for callers:
//! - Planning tasks from explicit pairs or from a source tree
//! - Building a [`TransferQueue`] from the engine configuration
//! - Running the queue with a copy-verify-retry runner and producing a
//!   [`BatchReport`]

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::copier::FileCopier;
use crate::error::{classify_io_error, ErrorKind, Side, TransferError};
use crate::fs_ops;
use crate::model::{BatchSummary, FileTransferResult, TransferTask};
use crate::progress::{ProgressSample, TransferObserver};
use crate::queue::{QueueError, TaskContext, TaskError, TaskRunner, TransferQueue};
use crate::retry::RetryStrategy;

/// How a batch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BatchOutcome {
    /// Every task was attempted. Individual failures are in `errors`.
    Completed,
    /// The batch stopped scheduling after this task failed.
    Aborted {
        index: usize,
        kind: ErrorKind,
        message: String,
    },
    /// Stopped by the caller.
    Cancelled,
}

/// Everything a caller needs to know about one finished batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One slot per task, in task-index order
    pub results: Vec<Option<FileTransferResult>>,
    pub errors: Vec<TaskError>,
    pub outcome: BatchOutcome,
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        BatchSummary::from_results(&self.results)
    }

    /// Completed with no per-file failures.
    pub fn is_success(&self) -> bool {
        self.outcome == BatchOutcome::Completed && self.errors.is_empty()
    }
}

/// The [`TaskRunner`] used by [`TransferEngine`]: an atomic copy wrapped in
/// the engine's retry policy.
#[derive(Debug, Clone)]
pub struct CopyRunner {
    copier: FileCopier,
    retry: RetryStrategy,
}

impl CopyRunner {
    pub fn new(copier: FileCopier, retry: RetryStrategy) -> Self {
        CopyRunner { copier, retry }
    }
}

impl TaskRunner for CopyRunner {
    fn run(
        &self,
        task: &TransferTask,
        ctx: &TaskContext<'_>,
    ) -> Result<FileTransferResult, TransferError> {
        let cancel = ctx.cancel_token();
        let on_progress = |sample: &ProgressSample| ctx.report_progress(task, sample);
        self.retry.with_retry(cancel, |attempt| {
            if attempt > 1 {
                debug!(index = task.index, attempt, "retrying copy");
            }
            self.copier.try_copy(task, cancel, Some(&on_progress))
        })
    }
}

/// Entry point for running transfer batches.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    config: EngineConfig,
}

impl TransferEngine {
    /// Out-of-range settings are normalized here, once.
    pub fn new(config: EngineConfig) -> Self {
        TransferEngine {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Turn explicit (source, destination) pairs into tasks, recording each
    /// source's current size as the expected size.
    ///
    /// # Errors
    /// Fails on the first source that cannot be inspected or is not a file.
    pub fn plan_tasks<I, S, D>(&self, pairs: I) -> Result<Vec<TransferTask>, TransferError>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<PathBuf>,
        D: Into<PathBuf>,
    {
        pairs
            .into_iter()
            .enumerate()
            .map(|(index, (source, destination))| -> Result<TransferTask, TransferError> {
                let source: PathBuf = source.into();
                let metadata = fs::metadata(&source)
                    .map_err(|e| classify_io_error(e, &source, Side::Source))?;
                if !metadata.is_file() {
                    return Err(TransferError::Other {
                        message: format!("not a regular file: {}", source.display()),
                    });
                }
                Ok(TransferTask::new(index, source, destination).with_expected_size(metadata.len()))
            })
            .collect()
    }

    /// Plan a task for every regular file under `source`, mirrored under
    /// `destination`.
    ///
    /// # Errors
    /// Fails if `source` is missing, is not a directory, or cannot be read.
    pub fn plan_directory(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<Vec<TransferTask>, TransferError> {
        let metadata =
            fs::metadata(source).map_err(|e| classify_io_error(e, source, Side::Source))?;
        if !metadata.is_dir() {
            return Err(TransferError::Other {
                message: format!("source must be a directory: {}", source.display()),
            });
        }

        let entries = fs_ops::enumerate_files(source, destination)
            .map_err(|e| classify_io_error(e, source, Side::Source))?;
        let tasks: Vec<_> = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                TransferTask::new(index, entry.source, entry.destination)
                    .with_expected_size(entry.size)
            })
            .collect();

        info!(
            source = %source.display(),
            files = tasks.len(),
            bytes = tasks.iter().filter_map(|t| t.expected_size).sum::<u64>(),
            "planned directory"
        );
        Ok(tasks)
    }

    /// Remove temp files left by an interrupted run from every existing
    /// destination directory of `tasks`. Returns how many were removed.
    ///
    /// Must not run while another batch writes into the same directories.
    pub fn sweep_stale_temp_files(&self, tasks: &[TransferTask]) -> usize {
        let dirs: BTreeSet<&Path> = tasks
            .iter()
            .filter_map(|t| t.destination.parent())
            .filter(|p| p.is_dir())
            .collect();

        dirs.into_iter()
            .map(|dir| match fs_ops::remove_stale_temp_files(dir) {
                Ok(n) => n,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "could not sweep stale temp files");
                    0
                }
            })
            .sum()
    }

    /// Create a queue for `tasks` using this engine's concurrency settings.
    pub fn queue(&self, tasks: Vec<TransferTask>) -> TransferQueue {
        let mut queue = TransferQueue::new(self.config.queue_config());
        queue.add_tasks(tasks);
        queue
    }

    /// Build the runner that copies one task with retries.
    pub fn runner(&self) -> CopyRunner {
        CopyRunner::new(FileCopier::new(self.config.copy_options()), self.config.retry)
    }

    /// Execute `queue` and summarize the batch.
    ///
    /// Task failures and cancellation are part of the report, not errors.
    ///
    /// # Errors
    /// Only for a queue that cannot run at all: invalid task indices or an
    /// `execute` already in progress.
    pub fn run(
        &self,
        queue: &TransferQueue,
        observer: Option<&dyn TransferObserver>,
    ) -> Result<BatchReport, QueueError> {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%batch_id, tasks = queue.tasks().len(), "batch started");

        let runner = self.runner();
        let outcome = match queue.execute(&runner, observer) {
            Ok(_) => BatchOutcome::Completed,
            Err(QueueError::TaskFailed { index, source }) => BatchOutcome::Aborted {
                index,
                kind: source.kind(),
                message: source.to_string(),
            },
            Err(QueueError::Cancelled { .. }) => BatchOutcome::Cancelled,
            Err(e) => return Err(e),
        };

        let report = BatchReport {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            results: queue.results(),
            errors: queue.errors(),
            outcome,
        };
        let summary = report.summary();
        info!(
            %batch_id,
            succeeded = summary.succeeded,
            errors = report.errors.len(),
            cancelled = summary.cancelled,
            bytes = summary.bytes_transferred,
            "batch finished"
        );
        Ok(report)
    }
}
