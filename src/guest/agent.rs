//! The guest binary's event loop: a handshake over stdin/stdout, then a
//! single-threaded `mio` loop multiplexing stdin (new watch/unwatch
//! requests) against every live [`Watcher`]'s inotify fd.
//!
//! Mirrors the structure of the original WSL-side agent (one `libev` loop
//! with a stdin watcher and, historically, a single shared inotify
//! instance) generalized to one inotify instance per watched directory so
//! that a [`Watcher`] can be torn down independently of its siblings.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};
use crate::protocol::{self, DirectoryId, FramedReader, Message};

use super::watcher::{StartWatch, Watcher};

const STDIN_TOKEN: Token = Token(0);

/// Reads and checks the fixed handshake pair on `stdin`/`stdout`. Blocking,
/// by design: nothing else can usefully happen before the host confirms the
/// guest speaks the same protocol version.
fn perform_handshake(stdin: &mut impl Read, stdout: &mut impl Write) -> Result<()> {
    let mut buf = [0u8; protocol::HELLO_LENGTH];
    stdin
        .read_exact(&mut buf)
        .map_err(|_| Error::handshake_failed())?;
    if buf != protocol::CLIENT_HELLO {
        return Err(Error::handshake_failed());
    }
    stdout.write_all(&protocol::SERVER_HELLO).map_err(Error::io)?;
    stdout.flush().map_err(Error::io)?;
    Ok(())
}

/// Runs the agent to completion: performs the handshake, then services
/// requests until stdin reaches EOF (the host closed the pipe, meaning the
/// guest process should exit).
pub fn run() -> Result<()> {
    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    perform_handshake(&mut stdin, &mut stdout)?;

    set_nonblocking(stdin.as_raw_fd())?;

    let mut poll = Poll::new().map_err(Error::io)?;
    let mut events = Events::with_capacity(64);

    poll.registry()
        .register(&mut SourceFd(&stdin.as_raw_fd()), STDIN_TOKEN, Interest::READABLE)
        .map_err(Error::io)?;

    let mut watchers: HashMap<Token, Watcher> = HashMap::new();
    let mut token_by_directory: HashMap<DirectoryId, Token> = HashMap::new();
    let mut next_token = 1usize;
    let mut reader = FramedReader::new();
    let mut running = true;

    while running {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::io(e));
        }

        for event in events.iter() {
            if event.token() == STDIN_TOKEN {
                if !drain_stdin(
                    &mut stdin,
                    &mut reader,
                    &mut stdout,
                    &mut poll,
                    &mut watchers,
                    &mut token_by_directory,
                    &mut next_token,
                )? {
                    running = false;
                }
                continue;
            }

            if let Some(watcher) = watchers.get_mut(&event.token()) {
                let mut out = Vec::new();
                // u64::MAX never collides with a queue processor's own
                // per-rescan cookie sequence (which starts at 0), so this
                // steady-state drain never spuriously matches an ancestor's
                // move_cookie.
                watcher.process_events(u64::MAX, &mut out);
                watcher.drain_queue(&mut out);
                flush_events(&mut stdout, &out)?;

                if watcher.is_failed() {
                    let fd = watcher.inotify_fd();
                    let directory_id = watcher.directory_id();
                    deregister_fd(&mut poll, fd);
                    watchers.remove(&event.token());
                    token_by_directory.remove(&directory_id);
                }
            }
        }
    }

    Ok(())
}

fn drain_stdin(
    stdin: &mut impl Read,
    reader: &mut FramedReader,
    stdout: &mut impl Write,
    poll: &mut Poll,
    watchers: &mut HashMap<Token, Watcher>,
    token_by_directory: &mut HashMap<DirectoryId, Token>,
    next_token: &mut usize,
) -> Result<bool> {
    let mut scratch = [0u8; 4096];
    loop {
        match stdin.read(&mut scratch) {
            Ok(0) => return Ok(false),
            Ok(n) => reader.feed(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io(e)),
        }
    }

    while let Some(payload) = reader.try_message() {
        match protocol::decode(&payload) {
            Some(Message::Watch(req)) => {
                let token = Token(*next_token);
                *next_token += 1;

                let mut out = Vec::new();
                match Watcher::start(
                    req.directory,
                    std::path::Path::new(&req.path),
                    req.recursive,
                    protocol::DIR_FAIL_CNT,
                    &mut out,
                ) {
                    StartWatch::Started(mut watcher) => {
                        log::trace!("started watch for directory {}", req.directory);
                        watcher.drain_queue(&mut out);
                        if watcher.is_failed() {
                            flush_events(stdout, &out)?;
                        } else {
                            register_watcher(poll, &watcher, token)?;
                            token_by_directory.insert(req.directory, token);
                            watchers.insert(token, watcher);
                            flush_events(stdout, &out)?;
                        }
                    }
                    StartWatch::Failed => {
                        log::warn!("failed to start watch for directory {}", req.directory);
                        flush_events(stdout, &out)?;
                    }
                }
            }
            Some(Message::Unwatch(req)) => {
                if let Some(token) = token_by_directory.remove(&req.directory) {
                    if let Some(watcher) = watchers.get(&token) {
                        deregister_fd(poll, watcher.inotify_fd());
                    }
                    watchers.remove(&token);
                }
            }
            Some(Message::Event(_)) | None => {
                // Events only ever flow guest -> host; an Event arriving on
                // stdin, or an unrecognized tag, is ignored per the wire
                // protocol's forward-compatibility rule.
            }
        }
    }

    Ok(true)
}

fn register_watcher(poll: &mut Poll, watcher: &Watcher, token: Token) -> Result<()> {
    let fd = watcher.inotify_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), token, Interest::READABLE)
        .map_err(Error::io)
}

fn deregister_fd(poll: &mut Poll, fd: std::os::unix::io::RawFd) {
    let _ = poll.registry().deregister(&mut SourceFd(&fd));
}

fn flush_events(stdout: &mut impl Write, events: &[protocol::EventRecord]) -> Result<()> {
    for event in events {
        stdout.write_all(&event.encode()).map_err(Error::io)?;
    }
    if !events.is_empty() {
        stdout.flush().map_err(Error::io)?;
    }
    Ok(())
}

fn set_nonblocking(fd: std::os::unix::io::RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(Error::io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn handshake_succeeds_on_matching_client_hello() {
        let mut stdin = Cursor::new(protocol::CLIENT_HELLO.to_vec());
        let mut stdout = Vec::new();
        perform_handshake(&mut stdin, &mut stdout).expect("handshake should succeed");
        assert_eq!(stdout, protocol::SERVER_HELLO);
    }

    #[test]
    fn handshake_rejects_mismatched_client_hello() {
        let mut stdin = Cursor::new(b"XXXXX".to_vec());
        let mut stdout = Vec::new();
        let err = perform_handshake(&mut stdin, &mut stdout).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::HandshakeFailed));
        assert!(stdout.is_empty());
    }

    #[test]
    fn handshake_rejects_truncated_client_hello() {
        let mut stdin = Cursor::new(b"WF".to_vec());
        let mut stdout = Vec::new();
        let err = perform_handshake(&mut stdin, &mut stdout).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::HandshakeFailed));
    }
}
