use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::ProtocolError;

/// Size of the standard message header in bytes.
pub const HEADER_LEN: usize = 16;

/// Wire opcodes understood by this crate.
///
/// See: https://www.mongodb.com/docs/manual/reference/mongodb-wire-protocol/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Reply to a legacy OP_QUERY / OP_GET_MORE (1)
    Reply = 1,
    /// Legacy update, never acknowledged (2001)
    Update = 2001,
    /// Legacy insert, never acknowledged (2002)
    Insert = 2002,
    /// Legacy query, also used for commands against `$cmd` (2004)
    Query = 2004,
    /// Legacy cursor continuation (2005)
    GetMore = 2005,
    /// Legacy delete, never acknowledged (2006)
    Delete = 2006,
    /// Legacy cursor cleanup (2007)
    KillCursors = 2007,
    /// Command request of wire versions 3-5 (2010)
    Command = 2010,
    /// Reply to OP_COMMAND (2011)
    CommandReply = 2011,
    /// Extensible message format (2013)
    Msg = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            2010 => Ok(OpCode::Command),
            2011 => Ok(OpCode::CommandReply),
            2013 => Ok(OpCode::Msg),
            _ => Err(value),
        }
    }
}

impl OpCode {
    /// Converts the OpCode to its wire value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Header shared by every wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total frame length including the header. Ignored when encoding.
    pub message_length: i32,
    /// Identifier assigned by the sender.
    pub request_id: i32,
    /// For replies, the `request_id` of the request being answered.
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Creates a header for an outgoing message. The length is filled in by the encoder.
    pub fn new(request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        Self {
            message_length: 0,
            request_id,
            response_to,
            op_code,
        }
    }

    /// Decodes a header from the front of `src`.
    pub(crate) fn decode(src: &mut BytesMut) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated("header"));
        }
        let message_length = src.get_i32_le();
        let request_id = src.get_i32_le();
        let response_to = src.get_i32_le();
        let raw_op_code = src.get_i32_le();
        let op_code = OpCode::try_from(raw_op_code).map_err(ProtocolError::UnknownOpcode)?;
        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Writes the header with the given total frame length.
    pub(crate) fn encode(&self, message_length: i32, dst: &mut BytesMut) {
        dst.put_i32_le(message_length);
        dst.put_i32_le(self.request_id);
        dst.put_i32_le(self.response_to);
        dst.put_i32_le(self.op_code.as_i32());
    }
}
