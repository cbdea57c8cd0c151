//! Ingest - Command-line interface for the transfer engine.
//!
//! Copies every file under a source directory into a destination directory,
//! verifying each copy, and prints progress and a summary to stderr.
//!
//! Exit codes: 0 all files copied, 1 some files failed (with
//! `--continue-on-error`), 2 invalid arguments, aborted or cancelled batch.
//!
//! The first Ctrl-C stops the batch and lets in-flight copies clean up their
//! temp files; a second one exits immediately.

use clap::Parser;
use engine::{
    BatchOutcome, BatchReport, CancelToken, ChecksumAlgorithm, EngineConfig, FileTransferResult,
    ProgressSample, RetryStrategy, TransferEngine, TransferObserver, TransferTask,
};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ingest - verified, atomic media offload
#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(version = "0.1.0")]
#[command(about = "Copy a directory tree with checksums, retries and progress tracking")]
struct Args {
    /// Source directory
    #[arg(long, value_name = "PATH")]
    src: PathBuf,

    /// Destination directory
    #[arg(long, value_name = "PATH")]
    dst: PathBuf,

    /// Number of files copied in parallel (1-10)
    #[arg(long, value_name = "N", default_value_t = 3)]
    concurrency: usize,

    /// Read/write chunk size in KiB (4-65536)
    #[arg(long, value_name = "KIB", default_value_t = 1024)]
    buffer_kib: usize,

    /// Skip re-reading every copy and comparing checksums before publishing it
    #[arg(long)]
    no_verify: bool,

    /// Checksum algorithm: crc32, md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM", default_value = "sha256")]
    hash: String,

    /// Replace files that already exist at the destination
    #[arg(long)]
    overwrite: bool,

    /// Keep copying after a file fails
    #[arg(long)]
    continue_on_error: bool,

    /// Attempts per file for transient failures (disconnects, network errors)
    #[arg(long, value_name = "N", default_value_t = 3)]
    retries: u32,

    /// Do not carry source modification times over to the copies
    #[arg(long)]
    no_preserve_mtime: bool,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// How a run that got as far as copying ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Clean,
    PartialFailure,
}

#[derive(Debug)]
struct ProgressState {
    per_task: Vec<u64>,
    last_update: Instant,
}

/// CLI implementation of TransferObserver for displaying transfer progress
struct CliProgress {
    verbose: bool,
    total_bytes: u64,
    state: Mutex<ProgressState>,
}

impl CliProgress {
    const MIN_REDRAW: Duration = Duration::from_millis(200);

    fn new(verbose: bool, tasks: &[TransferTask]) -> Self {
        CliProgress {
            verbose,
            total_bytes: tasks.iter().filter_map(|t| t.expected_size).sum(),
            state: Mutex::new(ProgressState {
                per_task: vec![0; tasks.len()],
                last_update: Instant::now(),
            }),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let percent = percent.min(100);
        let filled = (percent / 5) as usize;
        let empty = 20 - filled;
        format!(
            "[{}{}] {}%",
            "=".repeat(filled),
            " ".repeat(empty),
            percent
        )
    }

    fn file_name(path: &std::path::Path) -> &str {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("(unknown)")
    }

    fn redraw(&self, state: &mut ProgressState, force: bool) {
        if !force && state.last_update.elapsed() < Self::MIN_REDRAW {
            return;
        }
        state.last_update = Instant::now();

        let copied: u64 = state.per_task.iter().sum();
        let total = self.total_bytes.max(1);
        let percent = (copied as f64 / total as f64 * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{}",
            Self::print_progress_bar(percent),
            Self::format_bytes(copied),
            Self::format_bytes(self.total_bytes)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }
}

impl TransferObserver for CliProgress {
    fn on_task_started(&self, task: &TransferTask) {
        if self.verbose {
            eprintln!("\n[{:3}] Starting: {}", task.index, Self::file_name(&task.source));
        }
    }

    fn on_progress(&self, task: &TransferTask, sample: &ProgressSample) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bytes) = state.per_task.get_mut(task.index) {
            *bytes = sample.bytes_transferred;
        }
        self.redraw(&mut state, false);
    }

    fn on_task_completed(&self, index: usize, result: &FileTransferResult) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bytes) = state.per_task.get_mut(index) {
            // Failed copies leave nothing behind, so they stop counting.
            *bytes = result.bytes_transferred;
        }
        if self.verbose {
            let status = if result.success {
                if result.checksum_verified {
                    "Verified"
                } else {
                    "Done"
                }
            } else if result.is_cancelled() {
                "Cancelled"
            } else {
                "Failed"
            };
            eprintln!("\n[{:3}] {}: {}", index, status, Self::file_name(&result.source_path));
        }
        self.redraw(&mut state, true);
    }
}

fn print_summary(report: &BatchReport, verify: bool) {
    let summary = report.summary();
    let elapsed = (report.finished_at - report.started_at)
        .to_std()
        .unwrap_or_default();

    eprintln!();
    match &report.outcome {
        BatchOutcome::Completed => eprintln!("Transfer complete!"),
        BatchOutcome::Aborted { .. } => eprintln!("Transfer aborted!"),
        BatchOutcome::Cancelled => eprintln!("Transfer cancelled!"),
    }
    eprintln!(
        "Summary: {} done, {} failed, {} cancelled, {} not copied",
        summary.succeeded,
        report.errors.len(),
        summary.cancelled,
        summary.empty
    );
    if verify {
        eprintln!("Verification: {} OK", summary.verified);
    }
    eprintln!("Bytes copied: {}", CliProgress::format_bytes(summary.bytes_transferred));
    eprintln!(
        "Started: {}",
        report
            .started_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
    eprintln!("Elapsed: {}", CliProgress::format_duration(elapsed));
    eprintln!("Batch: {}", report.batch_id);

    if !report.errors.is_empty() {
        eprintln!();
        eprintln!("Failed files:");
        for error in &report.errors {
            eprintln!(
                "  {} ({}): {}",
                CliProgress::file_name(&error.source_path),
                error.kind,
                error.message
            );
        }
    }
}

/// Cancel `token` on the first Ctrl-C; exit with 130 on the second.
fn watch_for_interrupt(token: CancelToken) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(error = %e, "cannot listen for Ctrl-C");
            return;
        }
    };

    std::thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!("\nInterrupted, stopping... (Ctrl-C again to quit now)");
            token.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

/// Parse and validate command-line arguments, then run the batch
fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let exit_code = match run_cli(&args, |token| watch_for_interrupt(token.clone())) {
        Ok(RunStatus::Clean) => 0,
        Ok(RunStatus::PartialFailure) => 1,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

fn build_config(args: &Args) -> Result<EngineConfig, String> {
    let checksum_algorithm = args.hash.parse::<ChecksumAlgorithm>()?;

    if !(1..=engine::queue::MAX_CONCURRENCY).contains(&args.concurrency) {
        warn!(
            requested = args.concurrency,
            "concurrency out of range, using {}",
            engine::queue::DEFAULT_CONCURRENCY
        );
    }

    Ok(EngineConfig {
        concurrency_limit: args.concurrency,
        buffer_size: args.buffer_kib.saturating_mul(1024),
        verify_checksum: !args.no_verify,
        checksum_algorithm,
        overwrite: args.overwrite,
        preserve_mtime: !args.no_preserve_mtime,
        continue_on_error: args.continue_on_error,
        retry: RetryStrategy {
            max_attempts: args.retries,
            ..RetryStrategy::default()
        },
    })
}

/// Main CLI logic - separated for testability
///
/// `on_queue_ready` receives the queue's cancellation token before the batch
/// starts; cancelling it has the effect of `TransferQueue::stop`.
fn run_cli(args: &Args, on_queue_ready: impl FnOnce(&CancelToken)) -> Result<RunStatus, String> {
    // Validate source directory exists
    if !args.src.exists() {
        return Err(format!("Source directory does not exist: {}", args.src.display()));
    }

    if !args.src.is_dir() {
        return Err(format!("Source is not a directory: {}", args.src.display()));
    }

    // Validate destination directory path is valid
    if let Some(parent) = args.dst.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(format!(
                "Parent of destination does not exist: {}",
                parent.display()
            ));
        }
    }

    let engine = TransferEngine::new(build_config(args)?);

    let tasks = engine
        .plan_directory(&args.src, &args.dst)
        .map_err(|e| format!("Planning failed: {}", e))?;

    let swept = engine.sweep_stale_temp_files(&tasks);
    if swept > 0 {
        info!(swept, "removed temp files from an interrupted run");
    }

    let progress = CliProgress::new(args.verbose, &tasks);
    eprintln!("Preparing transfer...");
    eprintln!("  Source: {}", args.src.display());
    eprintln!("  Destination: {}", args.dst.display());
    eprintln!(
        "  Total: {} across {} files",
        CliProgress::format_bytes(progress.total_bytes),
        tasks.len()
    );
    eprintln!();

    let queue = engine.queue(tasks);
    on_queue_ready(queue.cancel_token());
    let report = engine
        .run(&queue, Some(&progress))
        .map_err(|e| format!("Transfer failed: {}", e))?;

    print_summary(&report, !args.no_verify);

    match report.outcome {
        BatchOutcome::Aborted { index, message, .. } => {
            Err(format!("Aborted at file {}: {}", index, message))
        }
        BatchOutcome::Cancelled => Err("Transfer cancelled".to_string()),
        BatchOutcome::Completed if report.errors.is_empty() => Ok(RunStatus::Clean),
        BatchOutcome::Completed => Ok(RunStatus::PartialFailure),
    }
}
