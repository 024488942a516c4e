//! PostgreSQL wire protocol, independent of the transport underneath.
//!
//! - [`channel`]: the byte channel a session runs over
//! - [`framing`]: buffered message reader and frontend encoders
//! - [`messages`]: backend message decoders
//! - [`session`]: startup, authentication and query state machine
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: the startup message omits the type tag.
//!
//! Over a WebSocket, binary frames carry arbitrary slices of this stream.
//! One frame may hold several messages or a fraction of one.

pub mod channel;
pub mod framing;
pub mod messages;
pub mod session;

pub use channel::Channel;
pub use framing::{FrameReader, RawMessage};
pub use messages::{
    AuthRequest, BackendKeyData, BackendMessage, ErrorFields, FieldDescription, TransactionStatus,
};
pub use session::WireSession;
