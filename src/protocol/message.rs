//! Length-prefixed message encode/decode (C1).
//!
//! Wire unit: an 8-byte little-endian length (top bit reserved, see
//! [`super::types::LENGTH_MASK`]) followed by that many payload bytes. The
//! payload's first byte is a message-type tag; the remaining head fields and
//! any trailing bytes (typically a path) follow with no implicit padding.
//!
//! This module only frames and unframes bytes — it does not validate field
//! contents (an unrecognized action code or tag is the caller's problem, per
//! the "unknown message tag: silently ignored" rule in the error taxonomy).

use super::types::{self, DirectoryId};

fn encode_message(tag: u8, head: &[u8], trailer: &[u8]) -> Vec<u8> {
    let payload_len = 1 + head.len() + trailer.len();
    let mut buf = Vec::with_capacity(8 + payload_len);
    buf.extend_from_slice(&(payload_len as u64).to_le_bytes());
    buf.push(tag);
    buf.extend_from_slice(head);
    buf.extend_from_slice(trailer);
    buf
}

/// `D` — a request to watch `directory`, optionally recursively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub directory: DirectoryId,
    pub filter: u32,
    pub recursive: bool,
    pub path: String,
}

impl WatchRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut head = Vec::with_capacity(13);
        head.extend_from_slice(&self.directory.to_le_bytes());
        head.extend_from_slice(&self.filter.to_le_bytes());
        head.push(self.recursive as u8);
        encode_message(types::TAG_WATCH, &head, self.path.as_bytes())
    }

    fn decode(rest: &[u8]) -> Option<Self> {
        if rest.len() < 13 {
            return None;
        }
        let directory = DirectoryId::from_le_bytes(rest[0..8].try_into().ok()?);
        let filter = u32::from_le_bytes(rest[8..12].try_into().ok()?);
        let recursive = rest[12] != 0;
        let path = String::from_utf8_lossy(&rest[13..]).into_owned();
        Some(WatchRequest {
            directory,
            filter,
            recursive,
            path,
        })
    }
}

/// `S` — a request to stop watching `directory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwatchRequest {
    pub directory: DirectoryId,
}

impl UnwatchRequest {
    pub fn encode(&self) -> Vec<u8> {
        encode_message(types::TAG_UNWATCH, &self.directory.to_le_bytes(), &[])
    }

    fn decode(rest: &[u8]) -> Option<Self> {
        if rest.len() < 8 {
            return None;
        }
        let directory = DirectoryId::from_le_bytes(rest[0..8].try_into().ok()?);
        Some(UnwatchRequest { directory })
    }
}

/// `U` — a single filesystem-change event for `directory`.
///
/// `action` is carried as a raw `u32`: the codec does not reject unknown
/// action codes, it only frames bytes. Use [`EventRecord::action`] to
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventRecord {
    pub directory: DirectoryId,
    pub action: u32,
    pub path: String,
}

impl EventRecord {
    pub fn new(directory: DirectoryId, action: types::Action, path: impl Into<String>) -> Self {
        Self {
            directory,
            action: action as u32,
            path: path.into(),
        }
    }

    pub fn action(&self) -> Option<types::Action> {
        types::Action::from_u32(self.action)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut head = Vec::with_capacity(12);
        head.extend_from_slice(&self.directory.to_le_bytes());
        head.extend_from_slice(&self.action.to_le_bytes());
        encode_message(types::TAG_EVENT, &head, self.path.as_bytes())
    }

    fn decode(rest: &[u8]) -> Option<Self> {
        if rest.len() < 12 {
            return None;
        }
        let directory = DirectoryId::from_le_bytes(rest[0..8].try_into().ok()?);
        let action = u32::from_le_bytes(rest[8..12].try_into().ok()?);
        let path = String::from_utf8_lossy(&rest[12..]).into_owned();
        Some(EventRecord {
            directory,
            action,
            path,
        })
    }
}

/// A decoded message payload (tag byte already consumed and dispatched on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Watch(WatchRequest),
    Unwatch(UnwatchRequest),
    Event(EventRecord),
}

/// Decode one message's payload (the bytes after the 8-byte length prefix,
/// as yielded by [`super::framed::FramedReader`]).
///
/// Returns `None` for a truncated head or an unrecognized tag; per the error
/// taxonomy this is silently ignored by callers rather than treated as a
/// protocol violation, so that future tags remain forward-compatible.
pub fn decode(payload: &[u8]) -> Option<Message> {
    let (&tag, rest) = payload.split_first()?;
    match tag {
        types::TAG_WATCH => WatchRequest::decode(rest).map(Message::Watch),
        types::TAG_UNWATCH => UnwatchRequest::decode(rest).map(Message::Unwatch),
        types::TAG_EVENT => EventRecord::decode(rest).map(Message::Event),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload_of(wire: &[u8]) -> &[u8] {
        let len = u64::from_le_bytes(wire[0..8].try_into().unwrap()) & types::LENGTH_MASK;
        &wire[8..8 + len as usize]
    }

    #[test]
    fn watch_request_round_trips_with_path_trailer() {
        let req = WatchRequest {
            directory: 0xdead_beef,
            filter: 0,
            recursive: true,
            path: "a/b/c".into(),
        };
        let wire = req.encode();
        match decode(payload_of(&wire)) {
            Some(Message::Watch(decoded)) => assert_eq!(decoded, req),
            other => panic!("expected Watch, got {other:?}"),
        }
    }

    #[test]
    fn unwatch_request_round_trips_with_empty_trailer() {
        let req = UnwatchRequest { directory: 42 };
        let wire = req.encode();
        match decode(payload_of(&wire)) {
            Some(Message::Unwatch(decoded)) => assert_eq!(decoded, req),
            other => panic!("expected Unwatch, got {other:?}"),
        }
    }

    #[test]
    fn event_round_trips_and_interprets_action() {
        let ev = EventRecord::new(7, types::Action::Added, "x");
        let wire = ev.encode();
        match decode(payload_of(&wire)) {
            Some(Message::Event(decoded)) => {
                assert_eq!(decoded, ev);
                assert_eq!(decoded.action(), Some(types::Action::Added));
            }
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn length_prefix_top_bit_is_zero_on_emit() {
        let wire = UnwatchRequest { directory: 1 }.encode();
        let len_word = u64::from_le_bytes(wire[0..8].try_into().unwrap());
        assert_eq!(len_word & types::LENGTH_RESERVED_BIT, 0);
    }

    #[test]
    fn unknown_tag_is_ignored_not_erroring() {
        let mut wire = UnwatchRequest { directory: 1 }.encode();
        // Flip the tag byte (first byte of the payload, right after the 8-byte length).
        wire[8] = b'?';
        assert_eq!(decode(payload_of(&wire)), None);
    }

    #[test]
    fn truncated_head_is_rejected() {
        assert_eq!(decode(&[types::TAG_UNWATCH, 1, 2, 3]), None);
    }

    #[test]
    fn empty_trailer_is_legal() {
        let req = WatchRequest {
            directory: 1,
            filter: 0,
            recursive: false,
            path: String::new(),
        };
        let wire = req.encode();
        match decode(payload_of(&wire)) {
            Some(Message::Watch(decoded)) => assert_eq!(decoded.path, ""),
            other => panic!("expected Watch, got {other:?}"),
        }
    }
}
