//! MongoDB wire protocol framing.
//!
//! This module implements the message formats a MongoDB-compatible server has
//! to understand on a single socket: the legacy opcodes (OP_QUERY, OP_GET_MORE,
//! OP_INSERT, ...), the short-lived OP_COMMAND generation and the current
//! OP_MSG format.
//!
//! ## Architecture
//!
//! ```text
//! +----------+                      +----------+
//! |  Client  |  --- Message ---->   |  Server  |
//! | (driver) |  <-- Message -----   | (worker) |
//! +----------+                      +----------+
//!               ^               ^
//!               |  MongoCodec   |
//!               +---------------+
//! ```
//!
//! ## Terminology
//!
//! - **MessageHeader**: The 16-byte prefix shared by every frame
//! - **OpCode**: Integer tag identifying the body layout
//! - **Message**: A decoded frame (header + opcode-specific body)
//! - **Reply**: The frame a server writes back, chosen by the request's opcode

pub mod codec;
pub mod error;
pub mod header;
pub mod message;
pub mod reply;

pub use codec::{DEFAULT_MAX_MESSAGE_SIZE, MongoCodec};
pub use error::ProtocolError;
pub use header::{HEADER_LEN, MessageHeader, OpCode};
pub use message::{
    CommandMessage, CommandReplyMessage, DeleteMessage, GetMoreMessage, InsertMessage,
    KillCursorsMessage, Message, MsgMessage, QueryMessage, ReplyMessage, Section, UpdateMessage,
    msg_flags,
};
pub use reply::{UnsupportedOpcode, build_reply, next_request_id};
