//! photowall protocol - relay broker wire format
//!
//! Daemons talk to the standalone relay broker over a Unix socket using
//! newline-delimited JSON. Every client frame carries the protocol version;
//! the broker rejects clients whose major version differs from its own.

pub mod frame;
pub mod message;
pub mod version;

pub use frame::{decode_frame, encode_frame, FrameError, MAX_FRAME_SIZE};
pub use message::{BrokerMessage, ClientMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};
