//! Progress accounting and reporting.
//!
//! [`ProgressTracker`] decides *when* a transfer is worth reporting. Reporting
//! every chunk is far too chatty for a 40 GB video and pointless for a 20 KB
//! sidecar file, so the tracker picks a throttle profile from the declared
//! size of the item using [`THROTTLE_TIERS`].
//!
//! [`TransferObserver`] is how the engine talks to its UI/telemetry consumers.
//! It is decoupled from any UI technology, in the same way the CLI and any
//! future front end subscribe to a batch.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::model::{FileTransferResult, TransferTask};

const MIB: u64 = 1024 * 1024;

/// A size bucket and the minimum spacing between two progress reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleTier {
    pub name: &'static str,
    /// Inclusive upper bound of the total size this tier applies to.
    pub max_total: u64,
    pub min_interval: Duration,
    pub min_bytes: u64,
}

/// Ordered by `max_total`; the last row catches everything.
pub const THROTTLE_TIERS: [ThrottleTier; 4] = [
    ThrottleTier {
        name: "small",
        max_total: 8 * MIB,
        min_interval: Duration::from_millis(100),
        min_bytes: 256 * 1024,
    },
    ThrottleTier {
        name: "medium",
        max_total: 128 * MIB,
        min_interval: Duration::from_millis(250),
        min_bytes: 4 * MIB,
    },
    ThrottleTier {
        name: "large",
        max_total: 2048 * MIB,
        min_interval: Duration::from_millis(500),
        min_bytes: 32 * MIB,
    },
    ThrottleTier {
        name: "huge",
        max_total: u64::MAX,
        min_interval: Duration::from_millis(1000),
        min_bytes: 128 * MIB,
    },
];

/// Pick the throttle tier for an item of `total_bytes`.
pub fn throttle_for(total_bytes: u64) -> ThrottleTier {
    THROTTLE_TIERS
        .iter()
        .copied()
        .find(|tier| total_bytes <= tier.max_total)
        .unwrap_or(THROTTLE_TIERS[THROTTLE_TIERS.len() - 1])
}

/// Point-in-time view of a transfer's progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 0.0 ..= 100.0
    pub percentage: f64,
    /// Bytes per second since the previous report.
    pub instantaneous_speed: f64,
}

/// Per-transfer byte/time accounting with size-tiered throttling.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_bytes: u64,
    bytes_transferred: u64,
    tier: ThrottleTier,
    started_at: Instant,
    last_report_at: Instant,
    bytes_at_last_report: u64,
}

impl ProgressTracker {
    /// Create a tracker for a transfer of `total_bytes`.
    pub fn new(total_bytes: u64) -> Self {
        Self::new_at(total_bytes, Instant::now())
    }

    fn new_at(total_bytes: u64, now: Instant) -> Self {
        ProgressTracker {
            total_bytes,
            bytes_transferred: 0,
            tier: throttle_for(total_bytes),
            started_at: now,
            last_report_at: now,
            bytes_at_last_report: 0,
        }
    }

    /// Start over, optionally with a new declared total.
    pub fn reset(&mut self, total_bytes: Option<u64>) {
        *self = Self::new(total_bytes.unwrap_or(self.total_bytes));
    }

    /// Account for `bytes` more transferred bytes.
    ///
    /// Returns true when a report is due: the minimum interval or the minimum
    /// byte count since the last [`commit`](Self::commit) has been crossed, or
    /// the transfer just reached its declared total.
    pub fn update(&mut self, bytes: u64) -> bool {
        self.update_at(bytes, Instant::now())
    }

    fn update_at(&mut self, bytes: u64, now: Instant) -> bool {
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);

        let pending = self.bytes_transferred - self.bytes_at_last_report;
        if pending == 0 {
            return false;
        }
        let reached_total =
            self.total_bytes > 0 && self.bytes_transferred >= self.total_bytes;

        reached_total
            || pending >= self.tier.min_bytes
            || now.duration_since(self.last_report_at) >= self.tier.min_interval
    }

    /// Mark the current state as reported; resets the throttle baseline.
    pub fn commit(&mut self) {
        self.commit_at(Instant::now());
    }

    fn commit_at(&mut self, now: Instant) {
        self.last_report_at = now;
        self.bytes_at_last_report = self.bytes_transferred;
    }

    /// Snapshot of the current state for reporting.
    pub fn sample(&self) -> ProgressSample {
        self.sample_at(Instant::now())
    }

    fn sample_at(&self, now: Instant) -> ProgressSample {
        let window = now.duration_since(self.last_report_at).as_secs_f64();
        let window_bytes = self.bytes_transferred - self.bytes_at_last_report;
        let instantaneous_speed = if window > 0.0 {
            window_bytes as f64 / window
        } else {
            0.0
        };

        ProgressSample {
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            percentage: self.percentage(),
            instantaneous_speed,
        }
    }

    fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }

    /// More bytes went through than were declared; treat as corruption.
    pub fn has_overflow(&self) -> bool {
        self.bytes_transferred > self.total_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Get the declared total
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn tier(&self) -> ThrottleTier {
        self.tier
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Bytes per second since construction (or the last reset).
    pub fn average_speed(&self) -> f64 {
        Self::speed(self.bytes_transferred, self.started_at.elapsed())
    }

    fn speed(bytes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        bytes as f64 / secs
    }

    /// Estimated time to finish at the average speed so far.
    pub fn eta(&self) -> Option<Duration> {
        self.eta_at(Instant::now())
    }

    fn eta_at(&self, now: Instant) -> Option<Duration> {
        let speed = Self::speed(self.bytes_transferred, now.duration_since(self.started_at));
        if speed <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_transferred);
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}

/// Receives events from a running batch.
///
/// Methods are called from worker threads as well as the coordinating
/// thread, hence `Sync`. All methods default to doing nothing.
pub trait TransferObserver: Send + Sync {
    /// A task has been scheduled onto a worker.
    fn on_task_started(&self, _task: &TransferTask) {}

    /// Throttled progress for one task.
    fn on_progress(&self, _task: &TransferTask, _sample: &ProgressSample) {}

    /// A task settled. Called exactly once per started task.
    fn on_task_completed(&self, _index: usize, _result: &FileTransferResult) {}
}
