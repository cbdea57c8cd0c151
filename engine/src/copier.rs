//! Atomic copy-and-verify of a single file.
//!
//! A copy is only ever observable in two states at its final path: absent,
//! or complete and correct. Bytes are streamed into a uniquely-named
//! temporary file in the destination directory, hashed on the way through,
//! checked for length, optionally re-read and re-hashed, and only then
//! renamed onto the destination. Every failure path drops the temporary
//! file, which deletes it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::checksums::{checksum_reader, ChecksumAlgorithm, ChecksumStream};
use crate::error::{classify_io_error, Side, TransferError};
use crate::fs_ops;
use crate::model::{FileTransferResult, TransferTask};
use crate::progress::{ProgressSample, ProgressTracker};

/// Default chunk size: 1 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Per-copy behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    /// Size of every read/write chunk
    pub buffer_size: usize,
    /// Re-read the written file and compare hashes before publishing it
    pub verify_checksum: bool,
    /// Replace an existing destination instead of failing
    pub overwrite: bool,
    pub algorithm: ChecksumAlgorithm,
    /// Carry the source modification time over to the copy
    pub preserve_mtime: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            buffer_size: DEFAULT_BUFFER_SIZE,
            verify_checksum: true,
            overwrite: false,
            algorithm: ChecksumAlgorithm::default(),
            preserve_mtime: true,
        }
    }
}

/// Wraps the temp file handle the copy loop writes through.
type SinkFactory = for<'a> fn(&'a mut File) -> Box<dyn Write + 'a>;

fn direct_sink(file: &mut File) -> Box<dyn Write + '_> {
    Box::new(file)
}

/// Copies one file at a time according to its [`CopyOptions`].
///
/// Holds no per-copy state, so one copier can be shared by every worker of
/// a queue.
#[derive(Clone)]
pub struct FileCopier {
    options: CopyOptions,
    sink: SinkFactory,
}

impl std::fmt::Debug for FileCopier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCopier")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FileCopier {
    /// Create a copier that writes straight to the temp file.
    pub fn new(options: CopyOptions) -> Self {
        FileCopier {
            options,
            sink: direct_sink,
        }
    }

    /// Get the copy options
    pub fn options(&self) -> &CopyOptions {
        &self.options
    }

    /// Copy `source` to `destination`, returning a result for every outcome.
    ///
    /// Failures and cancellation come back as a result with `success == false`
    /// and the matching `error_kind`; this never returns an `Err`.
    pub fn copy(
        &self,
        source: &Path,
        destination: &Path,
        cancel: &CancelToken,
        on_progress: Option<&dyn Fn(&ProgressSample)>,
    ) -> FileTransferResult {
        let task = TransferTask::new(0, source, destination);
        let started_at = Utc::now();
        let started = Instant::now();
        self.try_copy(&task, cancel, on_progress)
            .unwrap_or_else(|e| FileTransferResult::failed(&task, &e, started_at, started.elapsed()))
    }

    /// Copy one task, surfacing failures as classified errors.
    ///
    /// `Ok` is always a successful result. Cancellation is
    /// `Err(TransferError::Cancelled)`.
    pub fn try_copy(
        &self,
        task: &TransferTask,
        cancel: &CancelToken,
        on_progress: Option<&dyn Fn(&ProgressSample)>,
    ) -> Result<FileTransferResult, TransferError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let source = task.source.as_path();
        let destination = task.destination.as_path();

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut src_file =
            File::open(source).map_err(|e| classify_io_error(e, source, Side::Source))?;
        let src_metadata = src_file
            .metadata()
            .map_err(|e| classify_io_error(e, source, Side::Source))?;
        if src_metadata.is_dir() {
            return Err(TransferError::Other {
                message: format!("source is a directory: {}", source.display()),
            });
        }
        let expected = task.expected_size.unwrap_or(src_metadata.len());

        if !self.options.overwrite && destination.exists() {
            return Err(TransferError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }

        fs_ops::ensure_parent_dir_exists(destination)
            .map_err(|e| classify_io_error(e, destination, Side::Destination))?;
        let mut temp = fs_ops::create_temp_sibling(destination)
            .map_err(|e| classify_io_error(e, destination, Side::Destination))?;

        debug!(
            index = task.index,
            source = %source.display(),
            temp = %temp.path().display(),
            bytes = expected,
            "copy started"
        );

        let mut tracker = ProgressTracker::new(expected);
        let mut hasher = ChecksumStream::new(self.options.algorithm);
        let mut buffer = vec![0u8; self.options.buffer_size.max(1)];

        {
            let mut sink = (self.sink)(temp.as_file_mut());
            loop {
                if cancel.is_cancelled() {
                    debug!(index = task.index, "copy cancelled");
                    return Err(TransferError::Cancelled);
                }

                let n = read_chunk(&mut src_file, &mut buffer)
                    .map_err(|e| classify_io_error(e, source, Side::Source))?;
                if n == 0 {
                    break;
                }
                let chunk = &buffer[..n];

                sink.write_all(chunk)
                    .map_err(|e| classify_io_error(e, destination, Side::Destination))?;
                hasher.update(chunk);

                if tracker.update(n as u64) {
                    if let Some(report) = on_progress {
                        report(&tracker.sample());
                    }
                    tracker.commit();
                }
                if tracker.has_overflow() {
                    return Err(TransferError::mismatch(
                        source,
                        format!("source yielded more than the expected {expected} bytes"),
                    ));
                }
            }
            sink.flush()
                .map_err(|e| classify_io_error(e, destination, Side::Destination))?;
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| classify_io_error(e, destination, Side::Destination))?;

        let bytes_read = hasher.bytes_consumed();
        if bytes_read != expected {
            warn!(index = task.index, expected, bytes_read, "source length changed during copy");
            return Err(TransferError::mismatch(
                source,
                format!("expected {expected} bytes, read {bytes_read}"),
            ));
        }

        let bytes_written = temp
            .as_file()
            .metadata()
            .map_err(|e| classify_io_error(e, destination, Side::Destination))?
            .len();
        if bytes_written != bytes_read {
            warn!(index = task.index, bytes_read, bytes_written, "short or long write");
            return Err(TransferError::mismatch(
                destination,
                format!("read {bytes_read} bytes but {bytes_written} reached disk"),
            ));
        }

        let checksum = hasher.finalize();

        let verified = if self.options.verify_checksum {
            let mut written = File::open(temp.path())
                .map_err(|e| classify_io_error(e, destination, Side::Destination))?;
            let Some(dest_checksum) = checksum_reader(
                &mut written,
                self.options.algorithm,
                self.options.buffer_size,
                Some(cancel),
            )
            .map_err(|e| classify_io_error(e, destination, Side::Destination))?
            else {
                return Err(TransferError::Cancelled);
            };
            if dest_checksum != checksum {
                warn!(
                    index = task.index,
                    source_hash = %checksum,
                    written_hash = %dest_checksum,
                    "checksum mismatch after copy"
                );
                return Err(TransferError::mismatch(
                    destination,
                    format!("source {checksum} != written {dest_checksum}"),
                ));
            }
            true
        } else {
            false
        };

        if self.options.preserve_mtime {
            fs_ops::preserve_mtime(temp.path(), src_metadata.modified().ok());
        }

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let persisted = if self.options.overwrite {
            temp.persist(destination)
        } else {
            temp.persist_noclobber(destination)
        };
        persisted.map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                TransferError::DestinationExists {
                    path: destination.to_path_buf(),
                }
            } else {
                classify_io_error(e.error, destination, Side::Destination)
            }
        })?;

        if let Some(report) = on_progress {
            if tracker.bytes_transferred() == 0 {
                report(&tracker.sample());
            }
        }

        let duration = started.elapsed();
        debug!(
            index = task.index,
            destination = %destination.display(),
            bytes = bytes_read,
            verified,
            elapsed_ms = duration.as_millis() as u64,
            "copy finished"
        );

        Ok(FileTransferResult::succeeded(
            source,
            destination,
            bytes_read,
            checksum,
            verified,
            started_at,
            duration,
        ))
    }
}

/// Fill `buffer` from `reader`, short only at end of input.
fn read_chunk<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::compute_file_checksum;
    use crate::error::ErrorKind;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn options(verify: bool, overwrite: bool) -> CopyOptions {
        CopyOptions {
            buffer_size: 64 * 1024,
            verify_checksum: verify,
            overwrite,
            ..CopyOptions::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn temp_files_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| fs_ops::is_temp_file_name(&n.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Swallows everything after the first `limit` bytes while claiming
    /// success, like a flaky card reader or a lying driver.
    struct TruncatingWriter<'a> {
        inner: &'a mut File,
        remaining: usize,
    }

    impl Write for TruncatingWriter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let keep = buf.len().min(self.remaining);
            self.inner.write_all(&buf[..keep])?;
            self.remaining -= keep;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    const TRUNCATE_AT: usize = 6 * 1024 * 1024;

    fn truncating_sink(file: &mut File) -> Box<dyn Write + '_> {
        Box::new(TruncatingWriter {
            inner: file,
            remaining: TRUNCATE_AT,
        })
    }

    /// Flips one byte in the middle of every chunk.
    struct CorruptingWriter<'a> {
        inner: &'a mut File,
    }

    impl Write for CorruptingWriter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut copy = buf.to_vec();
            if let Some(b) = copy.get_mut(buf.len() / 2) {
                *b ^= 0xff;
            }
            self.inner.write_all(&copy)?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    fn corrupting_sink(file: &mut File) -> Box<dyn Write + '_> {
        Box::new(CorruptingWriter { inner: file })
    }

    fn copier_with_sink(options: CopyOptions, sink: SinkFactory) -> FileCopier {
        FileCopier { options, sink }
    }

    #[test]
    fn test_copy_produces_identical_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("IMG_0001.JPG");
        let dst = temp_dir.path().join("out").join("IMG_0001.JPG");
        fs::write(&src, pattern(300_000)).expect("Failed to write source");

        let copier = FileCopier::new(options(true, false));
        let result = copier.copy(&src, &dst, &CancelToken::new(), None);

        assert!(result.success, "copy failed: {:?}", result.error);
        assert!(result.checksum_verified);
        assert_eq!(result.bytes_transferred, 300_000);
        assert_eq!(fs::read(&dst).expect("read dest"), pattern(300_000));

        let src_sum = compute_file_checksum(&src, ChecksumAlgorithm::Sha256).expect("src sum");
        let dst_sum = compute_file_checksum(&dst, ChecksumAlgorithm::Sha256).expect("dst sum");
        assert_eq!(src_sum, dst_sum);
        assert_eq!(result.checksum.as_ref(), Some(&src_sum));
        assert!(temp_files_in(dst.parent().unwrap()).is_empty());
    }

    #[test]
    fn test_copy_empty_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("empty.xmp");
        let dst = temp_dir.path().join("copy.xmp");
        fs::write(&src, b"").expect("Failed to write source");

        let reports = Mutex::new(0);
        let on_progress = |_: &ProgressSample| *reports.lock().unwrap() += 1;
        let result = FileCopier::new(options(true, false)).copy(
            &src,
            &dst,
            &CancelToken::new(),
            Some(&on_progress),
        );

        assert!(result.success);
        assert_eq!(result.bytes_transferred, 0);
        assert!(dst.exists());
        assert_eq!(*reports.lock().unwrap(), 1);
    }

    #[test]
    fn test_progress_reports_reach_total() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("clip.mp4");
        let dst = temp_dir.path().join("clip-copy.mp4");
        fs::write(&src, pattern(2 * 1024 * 1024)).expect("Failed to write source");

        let samples = Mutex::new(Vec::new());
        let on_progress = |s: &ProgressSample| samples.lock().unwrap().push(*s);
        let result = FileCopier::new(options(false, false)).copy(
            &src,
            &dst,
            &CancelToken::new(),
            Some(&on_progress),
        );
        assert!(result.success);
        assert!(!result.checksum_verified);

        let samples = samples.into_inner().unwrap();
        assert!(!samples.is_empty());
        assert!(samples.windows(2).all(|w| w[0].bytes_transferred < w[1].bytes_transferred));
        let last = samples.last().unwrap();
        assert_eq!(last.bytes_transferred, 2 * 1024 * 1024);
        assert!((last.percentage - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_destination_absent_while_copying() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("clip.mp4");
        let out_dir = temp_dir.path().join("out");
        let dst = out_dir.join("clip.mp4");
        fs::write(&src, pattern(4 * 1024 * 1024)).expect("Failed to write source");

        // (destination exists, temp siblings) at every report
        let seen = Mutex::new(Vec::new());
        let on_progress = |_: &ProgressSample| {
            seen.lock()
                .unwrap()
                .push((dst.exists(), temp_files_in(&out_dir).len()));
        };
        let result = FileCopier::new(options(true, false)).copy(
            &src,
            &dst,
            &CancelToken::new(),
            Some(&on_progress),
        );
        assert!(result.success, "{:?}", result.error);

        let seen = seen.into_inner().unwrap();
        assert!(seen.len() > 1);
        assert!(seen.iter().all(|&s| s == (false, 1)), "{seen:?}");
        assert!(dst.exists());
        assert!(temp_files_in(&out_dir).is_empty());
    }

    #[test]
    fn test_existing_destination_without_overwrite_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.jpg");
        let dst = temp_dir.path().join("b.jpg");
        fs::write(&src, b"new").expect("write src");
        fs::write(&dst, b"old").expect("write dst");

        let result = FileCopier::new(options(true, false)).copy(&src, &dst, &CancelToken::new(), None);

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Unknown));
        assert_eq!(fs::read(&dst).expect("read dst"), b"old");
        assert!(temp_files_in(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_recopy_with_overwrite_is_idempotent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.cr3");
        let dst = temp_dir.path().join("b.cr3");
        fs::write(&src, pattern(123_457)).expect("write src");

        let copier = FileCopier::new(options(true, true));
        let first = copier.copy(&src, &dst, &CancelToken::new(), None);
        let second = copier.copy(&src, &dst, &CancelToken::new(), None);

        assert!(first.success && second.success);
        assert!(second.checksum_verified);
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(fs::read(&dst).expect("read dst"), pattern(123_457));
    }

    #[test]
    fn test_missing_source_is_classified() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("gone.mov");
        let dst = temp_dir.path().join("out.mov");

        let result = FileCopier::new(options(true, false)).copy(&src, &dst, &CancelToken::new(), None);

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::SourceDisconnected));
        assert!(!dst.exists());
    }

    #[test]
    fn test_truncated_write_is_checksum_mismatch() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.mp4");
        let dst = temp_dir.path().join("out").join("big.mp4");
        fs::write(&src, pattern(10 * 1024 * 1024)).expect("write src");

        let copier = copier_with_sink(options(false, false), truncating_sink);
        let result = copier.copy(&src, &dst, &CancelToken::new(), None);

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ChecksumMismatch));
        assert!(!dst.exists());
        assert!(temp_files_in(dst.parent().unwrap()).is_empty());
    }

    #[test]
    fn test_corrupted_write_caught_by_verification() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.jpg");
        let dst = temp_dir.path().join("b.jpg");
        fs::write(&src, pattern(200_000)).expect("write src");

        let copier = copier_with_sink(options(true, false), corrupting_sink);
        let result = copier.copy(&src, &dst, &CancelToken::new(), None);

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ChecksumMismatch));
        assert!(!dst.exists());
        assert!(temp_files_in(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_expected_size_mismatch_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.jpg");
        let dst = temp_dir.path().join("b.jpg");
        fs::write(&src, pattern(1000)).expect("write src");

        let copier = FileCopier::new(options(true, false));
        let shorter = TransferTask::new(0, &src, &dst).with_expected_size(999);
        let err = copier
            .try_copy(&shorter, &CancelToken::new(), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);

        let longer = TransferTask::new(0, &src, &dst).with_expected_size(1001);
        let err = copier.try_copy(&longer, &CancelToken::new(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert!(!dst.exists());
    }

    #[test]
    fn test_cancel_mid_copy_leaves_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("long.mov");
        let dst = temp_dir.path().join("out").join("long.mov");
        fs::write(&src, pattern(16 * 1024 * 1024)).expect("write src");

        let token = CancelToken::new();
        let seen = Mutex::new(false);
        let on_progress = |_: &ProgressSample| {
            let mut seen = seen.lock().unwrap();
            if !*seen {
                *seen = true;
                token.cancel();
            }
        };
        let copier = FileCopier::new(CopyOptions {
            buffer_size: 4096,
            ..options(true, false)
        });
        let result = copier.copy(&src, &dst, &token, Some(&on_progress));

        assert!(result.is_cancelled(), "expected cancellation, got {:?}", result);
        assert!(!dst.exists());
        assert!(temp_files_in(dst.parent().unwrap()).is_empty());
    }

    #[test]
    fn test_already_cancelled_does_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.jpg");
        let dst = temp_dir.path().join("sub").join("b.jpg");
        fs::write(&src, b"abc").expect("write src");

        let token = CancelToken::new();
        token.cancel();
        let result = FileCopier::new(options(true, false)).copy(&src, &dst, &token, None);
        assert!(result.is_cancelled());
        assert!(!dst.parent().unwrap().exists());
    }

    #[test]
    fn test_mtime_is_preserved() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.jpg");
        let dst = temp_dir.path().join("b.jpg");
        fs::write(&src, b"abc").expect("write src");
        let when = filetime::FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(&src, when).expect("set mtime");

        let result = FileCopier::new(options(false, false)).copy(&src, &dst, &CancelToken::new(), None);
        assert!(result.success);
        let meta = fs::metadata(&dst).expect("dst metadata");
        assert_eq!(filetime::FileTime::from_last_modification_time(&meta), when);
    }

    #[test]
    fn test_read_chunk_fills_buffer() {
        let data = pattern(10);
        let mut reader: &[u8] = &data;
        let mut buf = [0u8; 4];
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 2);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 0);
    }
}
