//! Bounded-concurrency batch execution.
//!
//! [`TransferQueue::execute`] runs a batch of [`TransferTask`]s with at most
//! `concurrency_limit` of them in flight. Each task runs on its own scoped
//! thread and reports back to the coordinating thread over a channel; only
//! the coordinator touches results, errors and counters, so two tasks
//! finishing at the same moment cannot interleave their bookkeeping.

use chrono::Utc;
use crossbeam_channel::unbounded;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, TransferError};
use crate::model::{FileTransferResult, TransferTask};
use crate::progress::{ProgressSample, TransferObserver};

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const MAX_CONCURRENCY: usize = 10;

/// Out-of-range limits fall back to [`DEFAULT_CONCURRENCY`] rather than being
/// clamped.
pub fn normalize_concurrency(limit: usize) -> usize {
    if (1..=MAX_CONCURRENCY).contains(&limit) {
        limit
    } else {
        DEFAULT_CONCURRENCY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub concurrency_limit: usize,
    /// Keep scheduling after a task fails instead of aborting the batch
    pub continue_on_error: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            concurrency_limit: DEFAULT_CONCURRENCY,
            continue_on_error: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task {index} failed: {source}")]
    TaskFailed {
        index: usize,
        #[source]
        source: TransferError,
    },

    #[error("batch cancelled after {completed} of {total} tasks")]
    Cancelled { completed: usize, total: usize },

    #[error("task index {index} is out of range or duplicated")]
    InvalidTaskIndex { index: usize },

    #[error("queue is already executing")]
    AlreadyRunning,
}

/// A failure recorded against one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub index: usize,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    fn new(task: &TransferTask, error: &TransferError) -> Self {
        TaskError {
            index: task.index,
            source_path: task.source.clone(),
            destination_path: task.destination.clone(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// What a running task gets to see of its queue.
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    cancel: &'a CancelToken,
    observer: Option<&'a dyn TransferObserver>,
}

impl<'a> TaskContext<'a> {
    pub fn new(cancel: &'a CancelToken, observer: Option<&'a dyn TransferObserver>) -> Self {
        TaskContext { cancel, observer }
    }

    pub fn cancel_token(&self) -> &'a CancelToken {
        self.cancel
    }

    /// Forward a progress sample to the batch observer, if any.
    pub fn report_progress(&self, task: &TransferTask, sample: &ProgressSample) {
        if let Some(observer) = self.observer {
            observer.on_progress(task, sample);
        }
    }
}

/// Executes one task. Called concurrently from several worker threads.
pub trait TaskRunner: Sync {
    fn run(
        &self,
        task: &TransferTask,
        ctx: &TaskContext<'_>,
    ) -> Result<FileTransferResult, TransferError>;
}

impl<F> TaskRunner for F
where
    F: Fn(&TransferTask, &TaskContext<'_>) -> Result<FileTransferResult, TransferError> + Sync,
{
    fn run(
        &self,
        task: &TransferTask,
        ctx: &TaskContext<'_>,
    ) -> Result<FileTransferResult, TransferError> {
        self(task, ctx)
    }
}

struct Settlement<'t> {
    task: &'t TransferTask,
    outcome: Result<FileTransferResult, TransferError>,
    started_at: chrono::DateTime<Utc>,
    duration: Duration,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A batch of transfers and its bookkeeping.
#[derive(Debug)]
pub struct TransferQueue {
    config: QueueConfig,
    tasks: Vec<TransferTask>,
    cancel: CancelToken,
    running: AtomicBool,
    active: AtomicUsize,
    completed: AtomicUsize,
    results: Mutex<Vec<Option<FileTransferResult>>>,
    errors: Mutex<Vec<TaskError>>,
}

impl TransferQueue {
    /// Create an empty queue. An out-of-range limit falls back to the default.
    pub fn new(config: QueueConfig) -> Self {
        TransferQueue {
            config: QueueConfig {
                concurrency_limit: normalize_concurrency(config.concurrency_limit),
                ..config
            },
            tasks: Vec::new(),
            cancel: CancelToken::new(),
            running: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Append tasks to the batch.
    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = TransferTask>) {
        self.tasks.extend(tasks);
    }

    /// Get the tasks in the batch
    pub fn tasks(&self) -> &[TransferTask] {
        &self.tasks
    }

    /// Run every task and return one slot per task, in task-index order.
    ///
    /// A slot is `Some` for every task that settled, except failures under
    /// `continue_on_error`, which leave the slot `None` and are only listed in
    /// [`errors`](Self::errors). Tasks never started also stay `None`.
    ///
    /// # Errors
    /// - [`QueueError::TaskFailed`] for the first failure when not continuing
    ///   on error; in-flight tasks are drained first
    /// - [`QueueError::Cancelled`] after [`stop`](Self::stop)
    /// - [`QueueError::InvalidTaskIndex`] if indices are not exactly `0..n`
    /// - [`QueueError::AlreadyRunning`] if another `execute` is in progress
    pub fn execute<R>(
        &self,
        runner: &R,
        observer: Option<&dyn TransferObserver>,
    ) -> Result<Vec<Option<FileTransferResult>>, QueueError>
    where
        R: TaskRunner + ?Sized,
    {
        let total = self.tasks.len();
        let mut seen = vec![false; total];
        for task in &self.tasks {
            match seen.get_mut(task.index) {
                Some(slot) if !*slot => *slot = true,
                _ => return Err(QueueError::InvalidTaskIndex { index: task.index }),
            }
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        *lock(&self.results) = vec![None; total];
        lock(&self.errors).clear();
        self.completed.store(0, Ordering::SeqCst);
        self.active.store(0, Ordering::SeqCst);

        if total == 0 {
            return Ok(Vec::new());
        }

        let limit = self.config.concurrency_limit;
        info!(tasks = total, limit, continue_on_error = self.config.continue_on_error, "queue started");
        let started = Instant::now();

        let ctx = TaskContext::new(&self.cancel, observer);
        let (tx, rx) = unbounded::<Settlement<'_>>();
        let mut failure: Option<(usize, TransferError)> = None;

        thread::scope(|scope| {
            let mut next = 0;
            let mut in_flight = 0usize;

            loop {
                while in_flight < limit
                    && next < total
                    && failure.is_none()
                    && !self.cancel.is_cancelled()
                {
                    let task = &self.tasks[next];
                    next += 1;
                    in_flight += 1;
                    self.active.fetch_add(1, Ordering::SeqCst);
                    if let Some(observer) = observer {
                        observer.on_task_started(task);
                    }
                    debug!(index = task.index, source = %task.source.display(), "task scheduled");

                    let tx = tx.clone();
                    scope.spawn(move || {
                        let started_at = Utc::now();
                        let clock = Instant::now();
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run(task, &ctx)))
                            .unwrap_or_else(|payload| {
                                Err(TransferError::Other {
                                    message: format!("task panicked: {}", panic_message(&*payload)),
                                })
                            });
                        // The receiver outlives every worker.
                        let _ = tx.send(Settlement {
                            task,
                            outcome,
                            started_at,
                            duration: clock.elapsed(),
                        });
                    });
                }

                if in_flight == 0 {
                    break;
                }
                let Ok(settled) = rx.recv() else {
                    break;
                };
                in_flight -= 1;
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.completed.fetch_add(1, Ordering::SeqCst);
                self.settle(settled, observer, &mut failure);
            }
        });

        let completed = self.completed.load(Ordering::SeqCst);
        if let Some((index, source)) = failure {
            warn!(index, completed, total, "queue aborted after task failure");
            return Err(QueueError::TaskFailed { index, source });
        }
        if self.cancel.is_cancelled() {
            info!(completed, total, "queue cancelled");
            return Err(QueueError::Cancelled { completed, total });
        }

        info!(
            completed,
            errors = lock(&self.errors).len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "queue finished"
        );
        Ok(self.results())
    }

    fn settle(
        &self,
        settled: Settlement<'_>,
        observer: Option<&dyn TransferObserver>,
        failure: &mut Option<(usize, TransferError)>,
    ) {
        let task = settled.task;
        let index = task.index;

        let (result, error) = match settled.outcome {
            Ok(result) => (result, None),
            Err(err) => {
                let result =
                    FileTransferResult::failed(task, &err, settled.started_at, settled.duration);
                (result, Some(err))
            }
        };

        if let Some(observer) = observer {
            observer.on_task_completed(index, &result);
        }

        let slot = match error {
            Some(err) if !err.is_cancelled() => {
                warn!(index, kind = %err.kind(), error = %err, "task failed");
                lock(&self.errors).push(TaskError::new(task, &err));
                if self.config.continue_on_error {
                    None
                } else {
                    if failure.is_none() {
                        *failure = Some((index, err));
                    }
                    Some(result)
                }
            }
            _ => Some(result),
        };

        lock(&self.results)[index] = slot;
    }

    /// Stop scheduling and cancel running tasks. `execute` returns once
    /// nothing is in flight.
    pub fn stop(&self) {
        debug!("queue stop requested");
        self.cancel.cancel();
    }

    /// Forget all tasks and outcomes and install a fresh cancellation token.
    pub fn reset(&mut self) {
        self.tasks.clear();
        self.cancel = CancelToken::new();
        self.active.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        lock(&self.results).clear();
        lock(&self.errors).clear();
    }

    /// Tasks currently running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Tasks settled so far in the current or last run.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Get a snapshot of the failures recorded so far
    pub fn errors(&self) -> Vec<TaskError> {
        lock(&self.errors).clone()
    }

    /// Get a snapshot of the result slots, in task-index order
    pub fn results(&self) -> Vec<Option<FileTransferResult>> {
        lock(&self.results).clone()
    }

    pub fn concurrency_limit(&self) -> usize {
        self.config.concurrency_limit
    }

    pub fn continue_on_error(&self) -> bool {
        self.config.continue_on_error
    }

    /// Get the token that [`stop`](Self::stop) cancels.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}
