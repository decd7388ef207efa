//! Reply framing.
//!
//! The reply format a client can parse depends on the generation of the
//! request it sent: legacy queries expect OP_REPLY, OP_COMMAND expects
//! OP_COMMAND_REPLY and OP_MSG expects OP_MSG. [`build_reply`] picks the
//! right one from the request header.

use std::sync::atomic::{AtomicI32, Ordering};

use thiserror::Error;

use crate::document::WireDocument;
use crate::protocol::header::{MessageHeader, OpCode};
use crate::protocol::message::{
    CommandReplyMessage, Message, MsgMessage, ReplyMessage, Section,
};

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocates a request id for an outgoing message.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The request's opcode has no reply format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown opcode: cannot reply to {0:?}")]
pub struct UnsupportedOpcode(pub OpCode);

/// Builds the reply frame for `request` carrying `doc`.
///
/// Returns `Ok(None)` for the legacy write opcodes, which are only used for
/// unacknowledged writes and never get a reply.
///
/// OP_REPLY frames always have the QueryFailure flag clear: errors travel in
/// the document as `errmsg`, never through the legacy `$err` mechanism.
pub fn build_reply(
    request: &MessageHeader,
    doc: WireDocument,
) -> Result<Option<Message>, UnsupportedOpcode> {
    let reply = match request.op_code {
        OpCode::Query | OpCode::GetMore => Message::Reply(ReplyMessage {
            header: reply_header(request, OpCode::Reply),
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: 1,
            documents: vec![doc],
        }),
        OpCode::Insert | OpCode::Update | OpCode::Delete => return Ok(None),
        OpCode::Command | OpCode::CommandReply => Message::CommandReply(CommandReplyMessage {
            header: reply_header(request, OpCode::CommandReply),
            command_reply: doc,
            metadata: WireDocument::empty(),
            output_docs: Vec::new(),
        }),
        OpCode::Msg => Message::Msg(MsgMessage {
            header: reply_header(request, OpCode::Msg),
            flags: 0,
            sections: vec![Section::Body(doc)],
            checksum: None,
        }),
        op_code @ (OpCode::Reply | OpCode::KillCursors) => {
            return Err(UnsupportedOpcode(op_code));
        }
    };
    Ok(Some(reply))
}

fn reply_header(request: &MessageHeader, op_code: OpCode) -> MessageHeader {
    MessageHeader::new(next_request_id(), request.request_id, op_code)
}
