//! One guest helper process per distro, with its pipes and liveness state
//! (the `ForeignNotifier` of the original host shim).

use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, BOOL, ERROR_NOT_FOUND, HANDLE};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};
use windows_sys::Win32::System::Threading::{GetExitCodeProcess, STILL_ACTIVE};

use crate::error::{Error, Result};
use crate::protocol::{FramedReader, CLIENT_HELLO, HELLO_LENGTH, SERVER_HELLO};

/// Closes a handle, first cancelling any I/O outstanding on it. Tolerates
/// `ERROR_NOT_FOUND` from `CancelIoEx`, which just means nothing was
/// in flight.
///
/// # Safety
/// `handle` must be a valid, open `HANDLE` not used elsewhere afterward.
pub unsafe fn close_handle_cancelling(handle: HANDLE) {
    if handle == 0 || handle == -1 {
        return;
    }
    if CancelIoEx(handle, ptr::null()) == 0 {
        debug_assert_eq!(GetLastError(), ERROR_NOT_FOUND);
    }
    CloseHandle(handle);
}

/// The guest `wsl-fs-notify-agent` process for one distro: its stdin/stdout
/// pipe handles and the child process handle used to detect its death.
///
/// Always accessed through a `Box` so that its address is stable: the
/// overlapped stdout read stashes a raw pointer to this struct in its
/// `OVERLAPPED::hEvent` field (a standard trick for handing a completion
/// routine its context, since `hEvent` goes unused once a completion
/// routine is supplied) and that pointer must stay valid for as long as the
/// read is outstanding.
pub struct GuestInstance {
    pub distro: String,
    pub stdin_write: HANDLE,
    pub stdout_read: HANDLE,
    pub process: HANDLE,
    pub reader: FramedReader,
    pub read_buffer: Vec<u8>,
    pub overlapped: OVERLAPPED,
    /// Set once the process has been observed to exit, or its pipes closed
    /// out from under it; a failed instance is never reused for new watch
    /// requests (the caller falls back to `ERROR_WSL_START_FAILED`).
    pub failed: bool,
}

impl GuestInstance {
    pub fn new(
        distro: String,
        stdin_write: HANDLE,
        stdout_read: HANDLE,
        process: HANDLE,
        read_buffer_size: usize,
    ) -> Self {
        GuestInstance {
            distro,
            stdin_write,
            stdout_read,
            process,
            reader: FramedReader::new(),
            read_buffer: vec![0u8; read_buffer_size],
            // SAFETY: an all-zero OVERLAPPED is the documented way to
            // initialize one before first use.
            overlapped: unsafe { std::mem::zeroed() },
            failed: false,
        }
    }

    /// Sends the fixed `CLIENT_HELLO` and blocks for `SERVER_HELLO` on
    /// `stdout_read`, matching the guest's own blocking handshake exactly
    /// (nothing is framed yet at this point in the exchange).
    ///
    /// # Safety
    /// `stdin_write` must be a HANDLE opened for overlapped-capable writes
    /// and `stdout_read` valid for synchronous reads during this call only;
    /// the caller is expected to switch `stdout_read` to overlapped-driven
    /// reads immediately afterward.
    pub unsafe fn perform_handshake(stdin_write: HANDLE, stdout_read: HANDLE) -> Result<()> {
        use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};

        let mut written = 0u32;
        if WriteFile(
            stdin_write,
            CLIENT_HELLO.as_ptr(),
            HELLO_LENGTH as u32,
            &mut written,
            ptr::null_mut(),
        ) == 0
            || written as usize != HELLO_LENGTH
        {
            return Err(Error::handshake_failed());
        }

        let mut reply = [0u8; HELLO_LENGTH];
        let mut read = 0u32;
        if ReadFile(
            stdout_read,
            reply.as_mut_ptr(),
            HELLO_LENGTH as u32,
            &mut read,
            ptr::null_mut(),
        ) == 0
            || read as usize != HELLO_LENGTH
        {
            return Err(Error::handshake_failed());
        }

        if reply != SERVER_HELLO {
            return Err(Error::handshake_failed());
        }

        Ok(())
    }

    /// Checks `self.process`'s exit code and, if it has exited, marks this
    /// instance failed and closes its pipes so any pending overlapped reads
    /// complete with an error instead of hanging.
    ///
    /// # Safety
    /// `self.process`, `self.stdin_write`, and `self.stdout_read` must still
    /// be valid handles owned by this instance.
    pub unsafe fn check_process_liveness(&mut self) {
        let mut exit_code = 0u32;
        let ok: BOOL = GetExitCodeProcess(self.process, &mut exit_code);
        if ok != 0 && exit_code != STILL_ACTIVE {
            self.failed = true;
            close_handle_cancelling(self.stdin_write);
            close_handle_cancelling(self.stdout_read);
            self.stdin_write = -1;
            self.stdout_read = -1;
        }
    }
}

impl Drop for GuestInstance {
    fn drop(&mut self) {
        unsafe {
            close_handle_cancelling(self.stdin_write);
            close_handle_cancelling(self.stdout_read);
            if self.process != 0 && self.process != -1 {
                CloseHandle(self.process);
            }
        }
    }
}

