//! Error taxonomy for the transfer engine.
//!
//! Every failure that can end a file transfer is mapped onto the closed
//! [`ErrorKind`] set. The kind carries a fixed retryable bit, which is the only
//! thing [`crate::retry::RetryStrategy`] consults when deciding whether to try
//! again.
//!
//! Low-level `io::Error`s are turned into [`TransferError`] by
//! [`classify_io_error`], which looks at the portable `io::ErrorKind` first and
//! then at the raw OS code (Unix errno or Windows system error code).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Closed set of transfer failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Access to the source or destination was refused
    PermissionDenied,
    /// The destination volume is full or over quota
    InsufficientSpace,
    /// Bytes or hashes did not line up; the copy is corrupt
    ChecksumMismatch,
    /// The source device went away mid-transfer
    SourceDisconnected,
    /// A network share or link failed
    NetworkError,
    /// The transfer was cancelled cooperatively (not a failure)
    Cancelled,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Whether waiting and trying again may plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::NetworkError | ErrorKind::SourceDisconnected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::InsufficientSpace => "insufficient space",
            ErrorKind::ChecksumMismatch => "checksum mismatch",
            ErrorKind::SourceDisconnected => "source disconnected",
            ErrorKind::NetworkError => "network error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Which end of a copy an I/O error happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

/// A classified transfer failure.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("permission denied: {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("insufficient space writing {}", path.display())]
    InsufficientSpace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checksum mismatch for {}: {reason}", path.display())]
    ChecksumMismatch { path: PathBuf, reason: String },

    #[error("source disconnected while reading {}", path.display())]
    SourceDisconnected {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("network error on {}", path.display())]
    Network {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("destination already exists: {}", path.display())]
    DestinationExists { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{message}")]
    Other { message: String },
}

impl TransferError {
    /// The taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::SourceDisconnected { .. } => ErrorKind::SourceDisconnected,
            Self::Network { .. } => ErrorKind::NetworkError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DestinationExists { .. } | Self::Io { .. } | Self::Other { .. } => {
                ErrorKind::Unknown
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn mismatch(path: &Path, reason: impl Into<String>) -> Self {
        Self::ChecksumMismatch {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::PermissionDenied { source, .. }
            | Self::InsufficientSpace { source, .. }
            | Self::SourceDisconnected { source, .. }
            | Self::Network { source, .. }
            | Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod codes {
    pub const NO_SPACE: &[i32] = &[28, 122]; // ENOSPC, EDQUOT
    pub const DEVICE_GONE: &[i32] = &[5, 6, 19]; // EIO, ENXIO, ENODEV
    // ENETDOWN, ENETUNREACH, ENETRESET, ECONNABORTED, ECONNRESET, ETIMEDOUT,
    // EHOSTDOWN, EHOSTUNREACH, ESTALE
    pub const NETWORK: &[i32] = &[100, 101, 102, 103, 104, 110, 112, 113, 116];
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod codes {
    pub const NO_SPACE: &[i32] = &[28, 69]; // ENOSPC, EDQUOT
    pub const DEVICE_GONE: &[i32] = &[5, 6, 19]; // EIO, ENXIO, ENODEV
    // ENETDOWN, ENETUNREACH, ENETRESET, ECONNABORTED, ECONNRESET, ETIMEDOUT,
    // EHOSTDOWN, EHOSTUNREACH, ESTALE
    pub const NETWORK: &[i32] = &[50, 51, 52, 53, 54, 60, 64, 65, 70];
}

// Other unix flavours: only the codes POSIX numbers the same everywhere.
#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))
))]
mod codes {
    pub const NO_SPACE: &[i32] = &[28];
    pub const DEVICE_GONE: &[i32] = &[5, 6, 19];
    pub const NETWORK: &[i32] = &[];
}

#[cfg(windows)]
mod codes {
    // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL, ERROR_DISK_QUOTA_EXCEEDED
    pub const NO_SPACE: &[i32] = &[39, 112, 1295];
    // ERROR_NOT_READY, ERROR_CRC, ERROR_DEV_NOT_EXIST, ERROR_DEVICE_NOT_CONNECTED
    pub const DEVICE_GONE: &[i32] = &[21, 23, 55, 1167];
    // ERROR_BAD_NETPATH, ERROR_NETWORK_BUSY, ERROR_UNEXP_NET_ERR,
    // ERROR_NETNAME_DELETED, ERROR_SEM_TIMEOUT, ERROR_NETWORK_UNREACHABLE,
    // ERROR_CONNECTION_ABORTED
    pub const NETWORK: &[i32] = &[53, 54, 59, 64, 121, 1231, 1236];
}

#[cfg(not(any(unix, windows)))]
mod codes {
    pub const NO_SPACE: &[i32] = &[];
    pub const DEVICE_GONE: &[i32] = &[];
    pub const NETWORK: &[i32] = &[];
}

/// Returns true for UNC (`\\server\share`) and `//host/` style paths.
pub fn is_network_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with(r"\\") || s.starts_with("//")
}

/// Map a low-level I/O failure onto the transfer taxonomy.
///
/// `side` says whether the error came from reading the source or writing the
/// destination; a vanished file only means "disconnected" on the source side.
pub fn classify_io_error(err: io::Error, path: &Path, side: Side) -> TransferError {
    let path = path.to_path_buf();
    let code = err.raw_os_error();
    let code_in = |set: &[i32]| code.is_some_and(|c| set.contains(&c));

    if err.kind() == io::ErrorKind::PermissionDenied {
        return TransferError::PermissionDenied { path, source: err };
    }
    let no_space = matches!(
        err.kind(),
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
    );
    if no_space || code_in(codes::NO_SPACE) {
        return TransferError::InsufficientSpace { path, source: err };
    }

    let network_kind = matches!(
        err.kind(),
        io::ErrorKind::NetworkDown
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::StaleNetworkFileHandle
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    );
    if network_kind || code_in(codes::NETWORK) {
        return TransferError::Network { path, source: err };
    }

    let vanished = matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::UnexpectedEof
    ) || code_in(codes::DEVICE_GONE);
    if side == Side::Source && vanished {
        if is_network_path(&path) {
            return TransferError::Network { path, source: err };
        }
        return TransferError::SourceDisconnected { path, source: err };
    }

    TransferError::Io { path, source: err }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_flags() {
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(ErrorKind::SourceDisconnected.is_retryable());
        for kind in [
            ErrorKind::PermissionDenied,
            ErrorKind::InsufficientSpace,
            ErrorKind::ChecksumMismatch,
            ErrorKind::Cancelled,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.is_retryable(), "{kind} should not be retryable");
        }
    }

    #[test]
    fn test_permission_denied_on_either_side() {
        let p = Path::new("/media/card/DCIM/IMG_0001.JPG");
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            classify_io_error(err, p, Side::Source).kind(),
            ErrorKind::PermissionDenied
        );
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            classify_io_error(err, p, Side::Destination).kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_storage_kinds_without_raw_code() {
        let p = Path::new("/dst/clip.mp4");
        let full = classify_io_error(io::Error::from(io::ErrorKind::StorageFull), p, Side::Destination);
        assert_eq!(full.kind(), ErrorKind::InsufficientSpace);
        assert!(!full.is_retryable());

        let quota =
            classify_io_error(io::Error::from(io::ErrorKind::QuotaExceeded), p, Side::Destination);
        assert_eq!(quota.kind(), ErrorKind::InsufficientSpace);
    }

    #[test]
    fn test_network_kinds_without_raw_code() {
        let p = Path::new("/Volumes/nas/clip.mp4");
        for kind in [
            io::ErrorKind::NetworkDown,
            io::ErrorKind::NetworkUnreachable,
            io::ErrorKind::HostUnreachable,
            io::ErrorKind::StaleNetworkFileHandle,
        ] {
            let err = classify_io_error(io::Error::from(kind), p, Side::Source);
            assert_eq!(err.kind(), ErrorKind::NetworkError, "{kind:?}");
            assert!(err.is_retryable());
        }

        let unsupported = classify_io_error(io::Error::from(io::ErrorKind::Unsupported), p, Side::Source);
        assert_eq!(unsupported.kind(), ErrorKind::Unknown);
        assert!(!unsupported.is_retryable());
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_raw_codes_macos() {
        let p = Path::new("/Volumes/nas/clip.mp4");
        let quota = classify_io_error(io::Error::from_raw_os_error(69), p, Side::Destination);
        assert_eq!(quota.kind(), ErrorKind::InsufficientSpace);

        let stale = classify_io_error(io::Error::from_raw_os_error(70), p, Side::Source);
        assert_eq!(stale.kind(), ErrorKind::NetworkError);

        // EOPNOTSUPP is permanent
        let unsupported = classify_io_error(io::Error::from_raw_os_error(102), p, Side::Source);
        assert!(!unsupported.is_retryable());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_raw_codes_linux() {
        let p = Path::new("/dst/clip.mp4");
        let no_space = classify_io_error(io::Error::from_raw_os_error(28), p, Side::Destination);
        assert_eq!(no_space.kind(), ErrorKind::InsufficientSpace);
        assert_eq!(no_space.raw_os_error(), Some(28));

        let stale = classify_io_error(io::Error::from_raw_os_error(116), p, Side::Source);
        assert_eq!(stale.kind(), ErrorKind::NetworkError);

        let eio = classify_io_error(io::Error::from_raw_os_error(5), p, Side::Source);
        assert_eq!(eio.kind(), ErrorKind::SourceDisconnected);
    }

    #[test]
    fn test_not_found_depends_on_side() {
        let p = Path::new("/media/card/clip.mov");
        let src = classify_io_error(io::Error::from(io::ErrorKind::NotFound), p, Side::Source);
        assert_eq!(src.kind(), ErrorKind::SourceDisconnected);
        assert!(src.is_retryable());

        let dst = classify_io_error(
            io::Error::from(io::ErrorKind::NotFound),
            p,
            Side::Destination,
        );
        assert_eq!(dst.kind(), ErrorKind::Unknown);
        assert!(!dst.is_retryable());
    }

    #[test]
    fn test_disconnect_on_network_share_is_network_error() {
        let p = Path::new(r"\\nas\photos\clip.mov");
        let err = classify_io_error(io::Error::from(io::ErrorKind::NotFound), p, Side::Source);
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(is_network_path(Path::new("//nas/photos")));
        assert!(!is_network_path(Path::new("/Volumes/CARD")));
    }

    #[test]
    fn test_timeouts_are_network() {
        let p = Path::new("/dst/a.raw");
        let err = classify_io_error(io::Error::from(io::ErrorKind::TimedOut), p, Side::Destination);
        assert_eq!(err.kind(), ErrorKind::NetworkError);
    }

    #[test]
    fn test_display_includes_path() {
        let err = TransferError::mismatch(Path::new("/dst/a.jpg"), "expected 10 bytes, read 9");
        let msg = err.to_string();
        assert!(msg.contains("/dst/a.jpg"));
        assert!(msg.contains("expected 10 bytes"));
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }

    #[test]
    fn test_kind_serializes_camel_case() {
        let json = serde_json::to_string(&ErrorKind::InsufficientSpace).expect("serialize");
        assert_eq!(json, "\"insufficientSpace\"");
    }
}
