//! Bridges `ReadDirectoryChangesW` watches on a `\\wsl$\<distro>\...` share
//! to the guest distro's own `inotify`.
//!
//! A Windows process that watches a directory under a WSL network share
//! never sees the guest's filesystem activity: `ReadDirectoryChangesW`
//! only observes changes the Windows redirector itself makes, which for a
//! 9P-backed share is effectively nothing. This crate closes that gap by
//! installing a small shim into the watching process (see [`host`]) that
//! intercepts `ReadDirectoryChangesW`/`CancelIo`, launches a helper inside
//! the target distro (see [`guest`]), and relays inotify events back over a
//! length-prefixed pipe protocol (see [`protocol`]).
//!
//! # Crate layout
//!
//! - [`protocol`] — the wire format shared by both ends, platform-independent.
//! - [`guest`] (`cfg(unix)`) — the recursive inotify watch engine and the
//!   binary ([`wsl-fs-notify-agent`](../bin/agent.rs)) that runs it.
//! - [`host`] (`cfg(windows)`) — the import-table patch, guest process
//!   management, and per-handle buffer serialization.
//! - [`error`] — the error type shared by both sides.

pub mod error;
pub mod protocol;

#[cfg(unix)]
pub mod guest;

#[cfg(windows)]
pub mod host;

pub use error::{Error, ErrorKind, Result};
