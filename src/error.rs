//! Error type shared by the guest watch engine and the host interception shim.

use std::fmt;
use std::path::PathBuf;

/// The result type returned by fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error, with an optional list of paths that it concerns.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub paths: Vec<PathBuf>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    pub fn io(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    pub fn max_files_watch() -> Self {
        Self::new(ErrorKind::MaxFilesWatch)
    }

    pub fn handshake_failed() -> Self {
        Self::new(ErrorKind::HandshakeFailed)
    }

    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.paths = vec![path];
        self
    }

    pub fn with_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// The numeric code this error surfaces to the host through its
    /// last-error mechanism, for the subset of kinds the host shim reports.
    pub fn host_error_code(&self) -> Option<u32> {
        self.kind.host_error_code()
    }
}

/// The category of an error.
///
/// The four `*_FAILED`-style variants carry the exact numeric codes the
/// original implementation surfaced via the host's last-error mechanism
/// (`(1 << 29) | n`), preserved here so a caller reading `GetLastError()`
/// after a failed replacement call sees the same values.
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Generic error, with a free-form message.
    Generic(String),

    /// I/O error, with an underlying cause.
    Io(std::io::Error),

    /// A path involved in the operation could not be found. On the guest
    /// this maps to `ENOENT` while installing a watch.
    PathNotFound,

    /// The maximum number of inotify watches configured on the guest kernel
    /// has been reached (`ENOSPC` from `inotify_add_watch`).
    MaxFilesWatch,

    /// A watch for the given path/descriptor does not exist.
    WatchNotFound,

    /// Starting the guest helper process failed (pipe creation, process
    /// launch, or the process exited before completing the handshake).
    WslStartFailed,

    /// The handshake exchanged with the guest helper did not match the
    /// expected strings.
    HandshakeFailed,

    /// The host's notify-filter mode could not be changed for an existing
    /// watch.
    ModeChange,

    /// The guest's `inotify_init1` call failed.
    InotifyFailed,
}

impl ErrorKind {
    pub fn host_error_code(&self) -> Option<u32> {
        match self {
            ErrorKind::WslStartFailed => Some(0x2000_0001),
            ErrorKind::HandshakeFailed => Some(0x2000_0002),
            ErrorKind::ModeChange => Some(0x2000_0003),
            ErrorKind::InotifyFailed => Some(0x2000_0004),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        match self.paths.len() {
            0 => Ok(()),
            1 => write!(f, ": {:?}", self.paths[0]),
            _ => write!(f, ": {:?}", self.paths),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Generic(msg) => write!(f, "{}", msg),
            ErrorKind::Io(err) => write!(f, "io error: {}", err),
            ErrorKind::PathNotFound => write!(f, "path not found"),
            ErrorKind::MaxFilesWatch => write!(f, "inotify watch limit reached"),
            ErrorKind::WatchNotFound => write!(f, "watch not found"),
            ErrorKind::WslStartFailed => write!(f, "starting the guest helper failed"),
            ErrorKind::HandshakeFailed => write!(f, "handshake with the guest helper failed"),
            ErrorKind::ModeChange => write!(f, "could not change watch mode"),
            ErrorKind::InotifyFailed => write!(f, "inotify initialization failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_error_codes_match_original_constants() {
        assert_eq!(
            ErrorKind::WslStartFailed.host_error_code(),
            Some(0x2000_0001)
        );
        assert_eq!(
            ErrorKind::HandshakeFailed.host_error_code(),
            Some(0x2000_0002)
        );
        assert_eq!(ErrorKind::ModeChange.host_error_code(), Some(0x2000_0003));
        assert_eq!(
            ErrorKind::InotifyFailed.host_error_code(),
            Some(0x2000_0004)
        );
    }

    #[test]
    fn non_custom_kinds_have_no_host_error_code() {
        assert_eq!(Error::path_not_found().host_error_code(), None);
        assert_eq!(Error::max_files_watch().host_error_code(), None);
    }

    #[test]
    fn display_includes_paths() {
        let err = Error::path_not_found().with_path(PathBuf::from("/tmp/a"));
        assert_eq!(err.to_string(), "path not found: \"/tmp/a\"");
    }
}
