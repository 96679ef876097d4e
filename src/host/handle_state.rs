//! Per-`HANDLE` bookkeeping for an in-flight `ReadDirectoryChangesW` call
//! (the host side of invariant 3: a filled buffer always completes, even if
//! another watch request arrives and replaces it before the original is
//! flushed).
//!
//! One [`HandleState`] exists per directory `HANDLE` the application has
//! asked to watch, for as long as that `HANDLE` is outstanding. It queues
//! [`EventRecord`]s that arrive before the application has re-armed its
//! overlapped read, and serializes them into a `FILE_NOTIFY_INFORMATION`
//! chain as soon as a buffer is available.
//!
//! [`push`](HandleState::push) and [`arm`](HandleState::arm) never invoke the
//! application's completion routine themselves — they only return a
//! [`FlushOutcome`] describing what the caller should deliver. The
//! application's completion routine is foreign code that, per the normal
//! `ReadDirectoryChangesW` usage pattern, re-arms by calling
//! `ReadDirectoryChangesW` again from inside the callback; since that call
//! re-enters [`crate::host::shim`]'s detour and locks the same handle-state
//! table, invoking it while that table's mutex is held would deadlock the
//! (single) thread this shim runs on. Callers are expected to drop any lock
//! on the handle-state table before calling [`invoke`] on the outcome.

use std::collections::VecDeque;

use windows_sys::Win32::Foundation::{ERROR_OPERATION_ABORTED, ERROR_SUCCESS};
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_INFORMATION;
use windows_sys::Win32::System::IO::{LPOVERLAPPED_COMPLETION_ROUTINE, OVERLAPPED};

use crate::protocol::{Action, DirectoryId, EventRecord};

fn to_win32_action(action: Action) -> u32 {
    match action {
        Action::Added => windows_sys::Win32::Storage::FileSystem::FILE_ACTION_ADDED,
        Action::Removed => windows_sys::Win32::Storage::FileSystem::FILE_ACTION_REMOVED,
        Action::Modified => windows_sys::Win32::Storage::FileSystem::FILE_ACTION_MODIFIED,
        Action::RenamedOld => {
            windows_sys::Win32::Storage::FileSystem::FILE_ACTION_RENAMED_OLD_NAME
        }
        Action::RenamedNew => {
            windows_sys::Win32::Storage::FileSystem::FILE_ACTION_RENAMED_NEW_NAME
        }
        Action::Failed => unreachable!("FAILED events unwatch a handle, they are never queued"),
    }
}

/// The in-flight overlapped read an application is waiting on, plus any
/// events that queued up while no buffer was available.
pub struct HandleState {
    pub directory_id: DirectoryId,
    pub guest_stdin: isize,
    pending: VecDeque<EventRecord>,
    armed: Option<ArmedRead>,
}

struct ArmedRead {
    buffer: *mut u8,
    buffer_len: u32,
    overlapped: *mut OVERLAPPED,
    completion: LPOVERLAPPED_COMPLETION_ROUTINE,
}

/// A completion the caller must deliver once it holds no lock the
/// application's completion routine might need to re-enter.
pub struct FlushOutcome {
    overlapped: *mut OVERLAPPED,
    completion: LPOVERLAPPED_COMPLETION_ROUTINE,
    status: u32,
    bytes_written: u32,
}

/// Invokes the completion routine carried by `outcome`, if any. Must be
/// called with no lock held that the routine might need to re-acquire (it is
/// foreign code and may call back into this shim).
///
/// # Safety
/// `outcome`'s `overlapped` pointer must still be valid; it is the same
/// pointer the application supplied to its `ReadDirectoryChangesW` call and
/// must remain valid until the completion runs, per the overlapped I/O
/// contract.
pub unsafe fn invoke(outcome: Option<FlushOutcome>) {
    if let Some(outcome) = outcome {
        if let Some(completion) = outcome.completion {
            completion(outcome.status, outcome.bytes_written, outcome.overlapped);
        }
    }
}

impl HandleState {
    pub fn new(directory_id: DirectoryId, guest_stdin: isize) -> Self {
        HandleState {
            directory_id,
            guest_stdin,
            pending: VecDeque::new(),
            armed: None,
        }
    }

    /// Records the application's buffer for the current `ReadDirectoryChangesW`
    /// call. Does not itself flush — call [`try_flush`](Self::try_flush)
    /// (and [`invoke`] its result) once the caller holds no re-entrancy-prone
    /// lock.
    ///
    /// # Safety
    /// `buffer` must point to at least `buffer_len` writable bytes that stay
    /// valid until the completion routine runs, and `overlapped` must stay
    /// valid for the same period: both are the application's own responsibility
    /// under the overlapped I/O contract, which this shim is only relaying.
    pub unsafe fn arm(
        &mut self,
        buffer: *mut u8,
        buffer_len: u32,
        overlapped: *mut OVERLAPPED,
        completion: LPOVERLAPPED_COMPLETION_ROUTINE,
    ) {
        self.armed = Some(ArmedRead {
            buffer,
            buffer_len,
            overlapped,
            completion,
        });
    }

    /// An event destined for this handle arrived from the guest. Only
    /// enqueues it — the caller is responsible for calling
    /// [`try_flush`](Self::try_flush) once it has finished touching every
    /// handle a drained read's messages affected.
    pub fn push(&mut self, event: EventRecord) {
        self.pending.push_back(event);
    }

    /// Takes the armed read (if any) and returns a [`FlushOutcome`] that
    /// completes it with `ERROR_OPERATION_ABORTED` and zero bytes, used when
    /// `CancelIo` is called on this handle.
    pub fn abort_armed(&mut self) -> Option<FlushOutcome> {
        self.armed.take().map(|armed| FlushOutcome {
            overlapped: armed.overlapped,
            completion: armed.completion,
            status: ERROR_OPERATION_ABORTED,
            bytes_written: 0,
        })
    }

    /// Serializes as many queued events as fit into the armed buffer,
    /// mirroring `FILE_NOTIFY_INFORMATION`'s `NextEntryOffset`-chained
    /// layout, and returns the [`FlushOutcome`] the caller must [`invoke`].
    /// Returns `None` if either no buffer is armed or nothing is queued, in
    /// which case there is nothing to complete.
    pub fn try_flush(&mut self) -> Option<FlushOutcome> {
        if self.pending.is_empty() {
            return None;
        }
        let armed = self.armed.take()?;

        let mut offset: u32 = 0;
        let mut last_record_offset: Option<u32> = None;

        unsafe {
            while let Some(event) = self.pending.front() {
                let encoded: Vec<u16> = event.path.encode_utf16().collect();
                let name_bytes = (encoded.len() * 2) as u32;
                let record_len = name_bytes + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() as u32
                    - std::mem::size_of::<u16>() as u32;
                // Rounded so the next record starts on a DWORD boundary,
                // matching what `ReadDirectoryChangesW` itself produces.
                let record_len = (record_len + 3) & !3;

                if armed.buffer_len - offset < record_len {
                    break;
                }

                let record_addr = armed.buffer.add(offset as usize) as *mut FILE_NOTIFY_INFORMATION;
                (*record_addr).NextEntryOffset = record_len;
                (*record_addr).Action = to_win32_action(event.action().expect(
                    "host translation layer never queues an event with an unrecognized action",
                ));
                (*record_addr).FileNameLength = name_bytes;

                let name_dst = (record_addr as *mut u8)
                    .add(std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName))
                    as *mut u16;
                std::ptr::copy_nonoverlapping(encoded.as_ptr(), name_dst, encoded.len());

                last_record_offset = Some(offset);
                offset += record_len;
                self.pending.pop_front();
            }

            if let Some(last) = last_record_offset {
                let last_addr =
                    armed.buffer.add(last as usize) as *mut FILE_NOTIFY_INFORMATION;
                (*last_addr).NextEntryOffset = 0;
            }
        }

        // Events that didn't fit stay queued for the next arm(); nothing
        // re-arms them automatically, matching ReadDirectoryChangesW's
        // contract that the caller must re-issue a read to keep draining.
        Some(FlushOutcome {
            overlapped: armed.overlapped,
            completion: armed.completion,
            status: ERROR_SUCCESS,
            bytes_written: offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_queue_until_a_buffer_is_armed() {
        let mut state = HandleState::new(1, 0);
        state.push(EventRecord::new(1, Action::Added, "a"));
        state.push(EventRecord::new(1, Action::Modified, "b"));
        assert_eq!(state.pending.len(), 2);
    }

    #[test]
    fn flushing_with_no_events_does_not_consume_the_armed_buffer() {
        let mut state = HandleState::new(1, 0);
        let mut buf = [0u8; 64];
        unsafe {
            state.arm(buf.as_mut_ptr(), buf.len() as u32, std::ptr::null_mut(), None);
        }
        assert!(state.try_flush().is_none());
        assert!(state.armed.is_some());
    }

    #[test]
    fn buffer_too_small_for_first_record_leaves_event_queued() {
        let mut state = HandleState::new(1, 0);
        // A name long enough that sizeof(head) + 2*wlen exceeds the buffer.
        state.push(EventRecord::new(1, Action::Added, "a-name-too-long-to-fit"));
        assert_eq!(state.pending.len(), 1);

        let mut buf = [0u8; 4];
        unsafe {
            state.arm(buf.as_mut_ptr(), buf.len() as u32, std::ptr::null_mut(), None);
        }
        let outcome = state.try_flush().expect("arm()'d with events pending");
        assert_eq!(outcome.status, ERROR_SUCCESS);
        assert_eq!(outcome.bytes_written, 0);
        // Nothing fit: the event stays queued and the buffer is not
        // re-armed (caller must re-issue a read with a larger buffer).
        assert_eq!(state.pending.len(), 1);
        assert!(state.armed.is_none());
    }

    #[test]
    fn flush_packs_every_queued_event_that_fits_into_one_completion() {
        let mut state = HandleState::new(1, 0);
        state.push(EventRecord::new(1, Action::Added, "a"));
        state.push(EventRecord::new(1, Action::Modified, "b"));

        let mut buf = [0u8; 256];
        unsafe {
            state.arm(buf.as_mut_ptr(), buf.len() as u32, std::ptr::null_mut(), None);
        }
        let outcome = state.try_flush().expect("arm()'d with events pending");
        assert_eq!(outcome.status, ERROR_SUCCESS);
        assert!(outcome.bytes_written > 0);
        assert!(state.pending.is_empty());
    }
}
