//! Accumulates bytes from a stream and yields complete, length-framed
//! messages (C2).
//!
//! Holds a byte buffer and an "expected next length" cursor, in one of two
//! states: awaiting the 8-byte header, or awaiting the payload of a header
//! already read. The header is read exactly once per message; its masked
//! length is cached until the payload is fully buffered.

use std::io::Read;

use super::types::LENGTH_MASK;

#[derive(Debug, Default)]
pub struct FramedReader {
    buf: Vec<u8>,
    pending_len: Option<usize>,
}

impl FramedReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the source.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Return a complete message's payload if one is buffered, advancing
    /// past it. Does not block or read from any source.
    pub fn try_message(&mut self) -> Option<Vec<u8>> {
        if self.pending_len.is_none() {
            if self.buf.len() < 8 {
                return None;
            }
            let header: [u8; 8] = self.buf[0..8].try_into().unwrap();
            let raw = u64::from_le_bytes(header);
            self.pending_len = Some((raw & LENGTH_MASK) as usize);
            self.buf.drain(0..8);
        }

        let len = self.pending_len.expect("checked above");
        if self.buf.len() < len {
            return None;
        }
        self.pending_len = None;
        Some(self.buf.drain(0..len).collect())
    }

    /// Blocking variant: while no complete message is buffered, perform one
    /// read from `source` (up to 4 KiB) and feed it in; repeat until a
    /// message is available or the source reaches EOF or errors, in which
    /// case `None` is returned ("no message available and source
    /// exhausted").
    pub fn pull_message<R: Read>(&mut self, source: &mut R) -> Option<Vec<u8>> {
        loop {
            if let Some(msg) = self.try_message() {
                return Some(msg);
            }
            let mut scratch = [0u8; 4096];
            match source.read(&mut scratch) {
                Ok(0) => return None,
                Ok(n) => self.feed(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{self, Message, UnwatchRequest, WatchRequest};

    #[test]
    fn try_message_returns_none_until_complete() {
        let wire = UnwatchRequest { directory: 9 }.encode();
        let mut reader = FramedReader::new();
        reader.feed(&wire[..4]);
        assert_eq!(reader.try_message(), None);
        reader.feed(&wire[4..wire.len() - 1]);
        assert_eq!(reader.try_message(), None);
        reader.feed(&wire[wire.len() - 1..]);
        let payload = reader.try_message().expect("message complete");
        assert_eq!(
            message::decode(&payload),
            Some(Message::Unwatch(UnwatchRequest { directory: 9 }))
        );
    }

    #[test]
    fn arbitrary_chunking_yields_the_same_messages_as_feeding_whole() {
        let messages = vec![
            WatchRequest {
                directory: 1,
                filter: 0,
                recursive: true,
                path: "a".into(),
            }
            .encode(),
            UnwatchRequest { directory: 1 }.encode(),
            WatchRequest {
                directory: 2,
                filter: 0,
                recursive: false,
                path: "a/b/c".into(),
            }
            .encode(),
        ];
        let concatenated: Vec<u8> = messages.iter().flatten().copied().collect();

        let mut whole = FramedReader::new();
        whole.feed(&concatenated);
        let mut whole_out = Vec::new();
        while let Some(p) = whole.try_message() {
            whole_out.push(p);
        }

        for chunk_size in [1usize, 2, 3, 7, 16] {
            let mut chunked = FramedReader::new();
            let mut chunked_out = Vec::new();
            for chunk in concatenated.chunks(chunk_size) {
                chunked.feed(chunk);
                while let Some(p) = chunked.try_message() {
                    chunked_out.push(p);
                }
            }
            assert_eq!(chunked_out, whole_out, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn pull_message_reads_until_satisfied() {
        let wire = UnwatchRequest { directory: 3 }.encode();
        let mut source = std::io::Cursor::new(wire);
        let mut reader = FramedReader::new();
        let payload = reader.pull_message(&mut source).expect("one message");
        assert_eq!(
            message::decode(&payload),
            Some(Message::Unwatch(UnwatchRequest { directory: 3 }))
        );
    }

    #[test]
    fn pull_message_returns_none_on_eof_mid_message() {
        let wire = UnwatchRequest { directory: 3 }.encode();
        let mut source = std::io::Cursor::new(wire[..wire.len() - 2].to_vec());
        let mut reader = FramedReader::new();
        assert_eq!(reader.pull_message(&mut source), None);
    }
}
