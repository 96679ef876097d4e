//! Installs the `ReadDirectoryChangesW`/`CancelIo` replacements into the
//! hosting process's own import table and relays the calls they intercept
//! to per-distro guest helper processes.
//!
//! This module only does anything when the crate is loaded into another
//! process as a `cdylib` (see the `DllMain` entry point at the bottom);
//! built as an `rlib` and used as a library, [`install`]/[`uninstall`] are
//! still callable directly, which is how the integration tests in this
//! module exercise the path-parsing and message-framing logic without
//! actually patching a live process.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use windows_sys::Win32::Foundation::{BOOL, ERROR_INVALID_FUNCTION, FALSE, HANDLE, HINSTANCE, TRUE};
use windows_sys::Win32::Storage::FileSystem::GetFinalPathNameByHandleW;
use windows_sys::Win32::System::IO::{LPOVERLAPPED_COMPLETION_ROUTINE, OVERLAPPED};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::System::Pipes::CreateNamedPipeW;
use windows_sys::Win32::System::SubsystemForLinux::WslLaunch;
use windows_sys::Win32::System::Threading::{
    RegisterWaitForSingleObject, INFINITE, WT_EXECUTEONLYONCE,
};

use crate::error::{Error, Result};
use crate::host::handle_state::{self, HandleState};
use crate::host::imports::{for_each_import, patch_slot};
use crate::host::instance::{close_handle_cancelling, GuestInstance};
use crate::host::Config;
use crate::protocol::{self, message, Message};

type ReadDirectoryChangesWFn = unsafe extern "system" fn(
    HANDLE,
    *mut c_void,
    u32,
    BOOL,
    u32,
    *mut u32,
    *mut OVERLAPPED,
    LPOVERLAPPED_COMPLETION_ROUTINE,
) -> BOOL;
type CancelIoFn = unsafe extern "system" fn(HANDLE) -> BOOL;

static ORIGINAL_READ_DIRECTORY_CHANGES_W: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_CANCEL_IO: AtomicUsize = AtomicUsize::new(0);

fn patched_slots() -> &'static Mutex<Vec<(usize, usize)>> {
    static SLOTS: OnceLock<Mutex<Vec<(usize, usize)>>> = OnceLock::new();
    SLOTS.get_or_init(|| Mutex::new(Vec::new()))
}

fn guest_instances() -> &'static Mutex<HashMap<String, Box<GuestInstance>>> {
    static INSTANCES: OnceLock<Mutex<HashMap<String, Box<GuestInstance>>>> = OnceLock::new();
    INSTANCES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Keyed by the application's directory `HANDLE`, cast to `isize` (`HANDLE`
/// is not `Hash`/`Eq` itself but is defined as an `isize` newtype).
fn handle_states() -> &'static Mutex<HashMap<isize, HandleState>> {
    static STATES: OnceLock<Mutex<HashMap<isize, HandleState>>> = OnceLock::new();
    STATES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn shim_config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(Config::default)
}

/// Patches `ReadDirectoryChangesW` and `CancelIo` in the current process's
/// main executable's import table to point at this module's replacements.
///
/// # Safety
/// Must run on `DLL_PROCESS_ATTACH` (or equivalent single-threaded
/// initialization point) before any other thread can call the patched
/// functions, since patching a slot that is concurrently read is a data
/// race on most architectures without an interlocked write.
pub unsafe fn install() {
    let exe_base = GetModuleHandleW(ptr::null()) as usize;
    if exe_base == 0 {
        return;
    }

    for_each_import(exe_base, |import| {
        if !import.dll_name.eq_ignore_ascii_case("kernel32.dll") {
            return;
        }
        match import.function_name.as_str() {
            "ReadDirectoryChangesW" => unsafe {
                let previous = patch_slot(import.slot, read_directory_changes_w_detour as usize);
                ORIGINAL_READ_DIRECTORY_CHANGES_W.store(previous, Ordering::SeqCst);
                patched_slots().lock().unwrap().push((import.slot as usize, previous));
            },
            "CancelIo" => unsafe {
                let previous = patch_slot(import.slot, cancel_io_detour as usize);
                ORIGINAL_CANCEL_IO.store(previous, Ordering::SeqCst);
                patched_slots().lock().unwrap().push((import.slot as usize, previous));
            },
            _ => {}
        }
    });
}

/// Restores every IAT slot [`install`] patched and terminates any guest
/// helper processes still running.
///
/// # Safety
/// Same single-threaded-initialization caveat as [`install`], and must only
/// be called after `install` succeeded (e.g. on `DLL_PROCESS_DETACH`).
pub unsafe fn uninstall() {
    for (slot, original) in patched_slots().lock().unwrap().drain(..) {
        patch_slot(slot as *mut usize, original);
    }

    let mut instances = guest_instances().lock().unwrap();
    for (_, instance) in instances.drain() {
        if instance.process != 0 && instance.process != -1 {
            windows_sys::Win32::System::Threading::TerminateProcess(instance.process, 0);
        }
    }
}

fn true_read_directory_changes_w(
    h_directory: HANDLE,
    lp_buffer: *mut c_void,
    n_buffer_length: u32,
    b_watch_subtree: BOOL,
    dw_notify_filter: u32,
    lp_bytes_returned: *mut u32,
    lp_overlapped: *mut OVERLAPPED,
    lp_completion_routine: LPOVERLAPPED_COMPLETION_ROUTINE,
) -> BOOL {
    let addr = ORIGINAL_READ_DIRECTORY_CHANGES_W.load(Ordering::SeqCst);
    if addr == 0 {
        return FALSE;
    }
    let f: ReadDirectoryChangesWFn = unsafe { std::mem::transmute(addr) };
    unsafe {
        f(
            h_directory,
            lp_buffer,
            n_buffer_length,
            b_watch_subtree,
            dw_notify_filter,
            lp_bytes_returned,
            lp_overlapped,
            lp_completion_routine,
        )
    }
}

fn true_cancel_io(h_file: HANDLE) -> BOOL {
    let addr = ORIGINAL_CANCEL_IO.load(Ordering::SeqCst);
    if addr == 0 {
        return FALSE;
    }
    let f: CancelIoFn = unsafe { std::mem::transmute(addr) };
    unsafe { f(h_file) }
}

/// Extracts `(distro, forward-slash-relative-path)` from a
/// `\\?\UNC\wsl$\<distro>\...` final path, or `None` if the path doesn't
/// match that prefix (in which case the call isn't ours to intercept).
fn split_wsl_unc_path(path: &str) -> Option<(String, String)> {
    const PREFIX: &str = r"\\?\UNC\wsl$\";
    if !path.starts_with(PREFIX) {
        return None;
    }
    let rest = &path[13..];
    let sep = rest.find('\\')?;
    let distro = rest[..sep].to_string();
    let relative = rest[sep..].replace('\\', "/");
    Some((distro, relative))
}

unsafe fn get_final_path_by_handle(handle: HANDLE) -> Option<String> {
    let mut buf = vec![0u16; 1024];
    let len = GetFinalPathNameByHandleW(handle, buf.as_mut_ptr(), buf.len() as u32, 0);
    if len == 0 {
        return None;
    }
    if len as usize > buf.len() {
        buf.resize(len as usize, 0);
        let len2 = GetFinalPathNameByHandleW(handle, buf.as_mut_ptr(), buf.len() as u32, 0);
        if len2 == 0 || len2 as usize > buf.len() {
            return None;
        }
        buf.truncate(len2 as usize);
    } else {
        buf.truncate(len as usize);
    }
    Some(String::from_utf16_lossy(&buf))
}

/// Creates an overlapped-capable anonymous pipe pair. Win32's `CreatePipe`
/// cannot produce an overlapped handle on either end, so (as is standard
/// practice) a uniquely-named named pipe stands in for the read or write
/// end that needs `FILE_FLAG_OVERLAPPED`.
unsafe fn create_overlapped_pipe(overlapped_read_end: bool) -> Result<(HANDLE, HANDLE)> {
    use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAG_OVERLAPPED, FILE_GENERIC_READ, FILE_GENERIC_WRITE, OPEN_EXISTING,
    };
    use windows_sys::Win32::System::Pipes::{
        PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    };

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let pid = std::process::id();
    let name: Vec<u16> = format!(r"\\.\pipe\wsl-fs-notify-{pid}-{id}")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    let mut sa = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };

    let (server_access, client_access, server_overlapped) = if overlapped_read_end {
        (PIPE_ACCESS_INBOUND, FILE_GENERIC_WRITE, FILE_FLAG_OVERLAPPED)
    } else {
        (PIPE_ACCESS_OUTBOUND, FILE_GENERIC_READ, 0)
    };

    let server = CreateNamedPipeW(
        name.as_ptr(),
        server_access | server_overlapped,
        PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
        1,
        4096,
        4096,
        0,
        &mut sa,
    );
    if server == -1 {
        return Err(Error::io(std::io::Error::last_os_error()));
    }

    let client = CreateFileW(
        name.as_ptr(),
        client_access,
        0,
        &mut sa,
        OPEN_EXISTING,
        0,
        0,
    );
    if client == -1 {
        close_handle_cancelling(server);
        return Err(Error::io(std::io::Error::last_os_error()));
    }

    if overlapped_read_end {
        Ok((server, client))
    } else {
        Ok((client, server))
    }
}

/// Launches (or reuses) the guest helper for `distro`, performing the
/// handshake if this is a fresh launch.
fn ensure_guest_instance(distro: &str) -> Result<()> {
    let mut instances = guest_instances().lock().unwrap();
    if let Some(existing) = instances.get_mut(distro) {
        unsafe { existing.check_process_liveness() };
        if !existing.failed {
            return Ok(());
        }
        instances.remove(distro);
    }

    unsafe {
        let (stdin_read, stdin_write) = create_overlapped_pipe(false)?;
        let (stdout_read, stdout_write) = create_overlapped_pipe(true)?;

        let distro_wide: Vec<u16> = distro.encode_utf16().chain(std::iter::once(0)).collect();
        let command_wide: Vec<u16> = shim_config()
            .guest_command
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        let mut process: HANDLE = 0;
        let launch_result = WslLaunch(
            distro_wide.as_ptr(),
            command_wide.as_ptr(),
            FALSE,
            stdin_read,
            stdout_write,
            windows_sys::Win32::System::Console::GetStdHandle(
                windows_sys::Win32::System::Console::STD_ERROR_HANDLE,
            ),
            &mut process,
        );
        close_handle_cancelling(stdin_read);
        close_handle_cancelling(stdout_write);

        if launch_result != 0 {
            close_handle_cancelling(stdin_write);
            close_handle_cancelling(stdout_read);
            return Err(Error::new(crate::error::ErrorKind::WslStartFailed));
        }

        if let Err(e) = GuestInstance::perform_handshake(stdin_write, stdout_read) {
            close_handle_cancelling(stdin_write);
            close_handle_cancelling(stdout_read);
            windows_sys::Win32::Foundation::CloseHandle(process);
            return Err(e);
        }

        let mut wait_handle: HANDLE = 0;
        RegisterWaitForSingleObject(
            &mut wait_handle,
            process,
            Some(process_death_callback),
            process as *mut c_void,
            INFINITE,
            WT_EXECUTEONLYONCE,
        );

        let mut instance = Box::new(GuestInstance::new(
            distro.to_string(),
            stdin_write,
            stdout_read,
            process,
            shim_config().read_buffer_size,
        ));
        // Stash a stable pointer to this instance in the OVERLAPPED's
        // otherwise-unused hEvent field, so the completion routine can find
        // its way back without a second lookup by distro name.
        instance.overlapped.hEvent = &mut *instance as *mut GuestInstance as HANDLE;
        arm_stdout_read(&mut instance);

        instances.insert(distro.to_string(), instance);
    }

    Ok(())
}

unsafe extern "system" fn process_death_callback(_param: *mut c_void, _timed_out: u8) {
    let mut instances = guest_instances().lock().unwrap();
    for instance in instances.values_mut() {
        instance.check_process_liveness();
    }
}

/// Issues the next overlapped read of `instance`'s stdout pipe.
unsafe fn arm_stdout_read(instance: &mut GuestInstance) {
    use windows_sys::Win32::Storage::FileSystem::ReadFileEx;
    let buffer_ptr = instance.read_buffer.as_mut_ptr();
    let buffer_len = instance.read_buffer.len() as u32;
    ReadFileEx(
        instance.stdout_read,
        buffer_ptr as *mut c_void,
        buffer_len,
        &mut instance.overlapped,
        Some(stdout_read_completion),
    );
}

/// `ReadFileEx` completion routine for a guest's stdout pipe: feeds the
/// freshly read bytes into that instance's [`FramedReader`], dispatches any
/// complete `Event` messages to the matching [`HandleState`], then re-arms
/// the next read so the pipe keeps draining.
///
/// Messages are drained into their handles' FIFOs and the lock is released
/// before any handle is flushed: flushing invokes the application's own
/// completion routine, which typically re-arms by calling
/// `ReadDirectoryChangesW` again, and that call re-enters this module's
/// `handle_states()` lock. Flushing while still holding it would deadlock.
unsafe extern "system" fn stdout_read_completion(
    dw_error_code: u32,
    dw_number_of_bytes_transferred: u32,
    lp_overlapped: *mut OVERLAPPED,
) {
    const ERROR_OPERATION_ABORTED: u32 = 995;
    if dw_error_code == ERROR_OPERATION_ABORTED {
        return;
    }

    let instance = &mut *((*lp_overlapped).hEvent as *mut GuestInstance);
    let data = std::slice::from_raw_parts(
        instance.read_buffer.as_ptr(),
        dw_number_of_bytes_transferred as usize,
    );
    instance.reader.feed(data);

    let mut touched = std::collections::HashSet::new();
    {
        let mut states = handle_states().lock().unwrap();
        while let Some(payload) = instance.reader.try_message() {
            if let Some(Message::Event(event)) = message::decode(&payload) {
                let directory_handle = event.directory as isize;
                if let Some(state) = states.get_mut(&directory_handle) {
                    state.push(event);
                    touched.insert(directory_handle);
                }
            }
        }
    }

    for directory_handle in touched {
        let outcome = {
            let mut states = handle_states().lock().unwrap();
            states
                .get_mut(&directory_handle)
                .and_then(|state| state.try_flush())
        };
        handle_state::invoke(outcome);
    }

    if dw_error_code == 0 {
        arm_stdout_read(instance);
    }
}

unsafe extern "system" fn read_directory_changes_w_detour(
    h_directory: HANDLE,
    lp_buffer: *mut c_void,
    n_buffer_length: u32,
    b_watch_subtree: BOOL,
    dw_notify_filter: u32,
    lp_bytes_returned: *mut u32,
    lp_overlapped: *mut OVERLAPPED,
    lp_completion_routine: LPOVERLAPPED_COMPLETION_ROUTINE,
) -> BOOL {
    let Some(final_path) = get_final_path_by_handle(h_directory) else {
        return true_read_directory_changes_w(
            h_directory,
            lp_buffer,
            n_buffer_length,
            b_watch_subtree,
            dw_notify_filter,
            lp_bytes_returned,
            lp_overlapped,
            lp_completion_routine,
        );
    };

    let Some((distro, relative_path)) = split_wsl_unc_path(&final_path) else {
        return true_read_directory_changes_w(
            h_directory,
            lp_buffer,
            n_buffer_length,
            b_watch_subtree,
            dw_notify_filter,
            lp_bytes_returned,
            lp_overlapped,
            lp_completion_routine,
        );
    };

    if lp_completion_routine.is_none() {
        windows_sys::Win32::Foundation::SetLastError(ERROR_INVALID_FUNCTION);
        return FALSE;
    }

    let directory_id = h_directory as isize;
    let mut states = handle_states().lock().unwrap();

    if let Some(state) = states.get_mut(&directory_id) {
        state.arm(
            lp_buffer as *mut u8,
            n_buffer_length,
            lp_overlapped,
            lp_completion_routine,
        );
        let outcome = state.try_flush();
        drop(states);
        handle_state::invoke(outcome);
        return TRUE;
    }

    drop(states);
    if ensure_guest_instance(&distro).is_err() {
        windows_sys::Win32::Foundation::SetLastError(crate::error::ErrorKind::WslStartFailed.host_error_code().unwrap());
        return FALSE;
    }

    let guest_stdin = {
        let instances = guest_instances().lock().unwrap();
        match instances.get(&distro) {
            Some(instance) => instance.stdin_write,
            None => return FALSE,
        }
    };

    let mut state = HandleState::new(h_directory as u64, guest_stdin);
    state.arm(
        lp_buffer as *mut u8,
        n_buffer_length,
        lp_overlapped,
        lp_completion_routine,
    );
    // Freshly created, so nothing is queued yet; try_flush() is a no-op but
    // keeps this path matching the re-arm path above rather than invoking
    // arm()'s caller contract differently depending on which branch ran.
    let outcome = state.try_flush();
    handle_states().lock().unwrap().insert(directory_id, state);
    handle_state::invoke(outcome);

    let request = protocol::WatchRequest {
        directory: h_directory as u64,
        filter: dw_notify_filter,
        recursive: b_watch_subtree != 0,
        path: relative_path,
    };
    send_to_guest(guest_stdin, &request.encode());

    TRUE
}

unsafe extern "system" fn cancel_io_detour(h_file: HANDLE) -> BOOL {
    let directory_id = h_file as isize;
    let mut states = handle_states().lock().unwrap();
    let removed = states.remove(&directory_id);
    drop(states);

    if let Some(mut state) = removed {
        let outcome = state.abort_armed();
        handle_state::invoke(outcome);
        let request = protocol::UnwatchRequest {
            directory: h_file as u64,
        };
        send_to_guest(state.guest_stdin, &request.encode());
    }
    true_cancel_io(h_file)
}

unsafe fn send_to_guest(stdin_write: HANDLE, wire: &[u8]) {
    use windows_sys::Win32::Storage::FileSystem::WriteFile;
    let mut offset = 0usize;
    while offset < wire.len() {
        let mut written = 0u32;
        let ok = WriteFile(
            stdin_write,
            wire[offset..].as_ptr(),
            (wire.len() - offset) as u32,
            &mut written,
            ptr::null_mut(),
        );
        if ok == 0 || written == 0 {
            break;
        }
        offset += written as usize;
    }
}

#[no_mangle]
unsafe extern "system" fn DllMain(_hinst: HINSTANCE, dw_reason: u32, _reserved: *mut c_void) -> BOOL {
    const DLL_PROCESS_ATTACH: u32 = 1;
    const DLL_PROCESS_DETACH: u32 = 0;

    match dw_reason {
        DLL_PROCESS_ATTACH => install(),
        DLL_PROCESS_DETACH => uninstall(),
        _ => {}
    }
    TRUE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_wsl_unc_path_extracts_distro_and_forward_slash_path() {
        let (distro, rel) =
            split_wsl_unc_path(r"\\?\UNC\wsl$\Ubuntu-22.04\home\user\project").unwrap();
        assert_eq!(distro, "Ubuntu-22.04");
        assert_eq!(rel, "/home/user/project");
    }

    #[test]
    fn split_wsl_unc_path_rejects_non_wsl_paths() {
        assert!(split_wsl_unc_path(r"\\?\C:\Users\me").is_none());
    }

    #[test]
    fn split_wsl_unc_path_rejects_truncated_prefix() {
        assert!(split_wsl_unc_path(r"\\?\UNC\wsl$\onlydistro").is_none());
    }
}
