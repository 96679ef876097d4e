//! The wire protocol shared between the guest watch engine and the host
//! interception shim: message framing (C1, C2) and the constants and types
//! both ends agree on (C6).

pub mod framed;
pub mod message;
pub mod types;

pub use framed::FramedReader;
pub use message::{decode, EventRecord, Message, UnwatchRequest, WatchRequest};
pub use types::{
    Action, DirectoryId, CLIENT_HELLO, DEFAULT_GUEST_COMMAND, DIR_FAIL_CNT, HELLO_LENGTH,
    HOST_READ_BUFFER_SIZE, SERVER_HELLO,
};
