use bytes::{Buf, BufMut, BytesMut};

use crate::document::WireDocument;
use crate::protocol::ProtocolError;
use crate::protocol::codec::{
    ensure_remaining, get_cstring, get_document, get_documents, put_cstring, put_document,
};
use crate::protocol::header::{MessageHeader, OpCode};

/// OP_MSG flag bits.
pub mod msg_flags {
    /// A CRC-32C checksum follows the last section.
    pub const CHECKSUM_PRESENT: u32 = 1;
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Reply(ReplyMessage),
    Update(UpdateMessage),
    Insert(InsertMessage),
    Query(QueryMessage),
    GetMore(GetMoreMessage),
    Delete(DeleteMessage),
    KillCursors(KillCursorsMessage),
    Command(CommandMessage),
    CommandReply(CommandReplyMessage),
    Msg(MsgMessage),
}

/// OP_REPLY: answer to a legacy query or getMore.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    pub header: MessageHeader,
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<WireDocument>,
}

/// OP_UPDATE
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub header: MessageHeader,
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: WireDocument,
    pub update: WireDocument,
}

/// OP_INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub header: MessageHeader,
    pub flags: i32,
    pub full_collection_name: String,
    pub documents: Vec<WireDocument>,
}

/// OP_QUERY: legacy query, or a command when sent to `<db>.$cmd`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
    pub header: MessageHeader,
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: WireDocument,
    pub return_fields_selector: Option<WireDocument>,
}

impl QueryMessage {
    /// Database part of the namespace.
    pub fn database(&self) -> &str {
        self.full_collection_name
            .split_once('.')
            .map_or(self.full_collection_name.as_str(), |(db, _)| db)
    }

    /// Returns true if this query targets the `$cmd` pseudo-collection.
    pub fn is_command(&self) -> bool {
        self.full_collection_name.ends_with(".$cmd")
    }
}

/// OP_GET_MORE
#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreMessage {
    pub header: MessageHeader,
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

/// OP_DELETE
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub header: MessageHeader,
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: WireDocument,
}

/// OP_KILL_CURSORS
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsMessage {
    pub header: MessageHeader,
    pub cursor_ids: Vec<i64>,
}

/// OP_COMMAND
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub header: MessageHeader,
    pub database: String,
    pub command_name: String,
    pub metadata: WireDocument,
    pub command_args: WireDocument,
    pub input_docs: Vec<WireDocument>,
}

/// OP_COMMAND_REPLY
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReplyMessage {
    pub header: MessageHeader,
    pub command_reply: WireDocument,
    pub metadata: WireDocument,
    pub output_docs: Vec<WireDocument>,
}

/// OP_MSG
#[derive(Debug, Clone, PartialEq)]
pub struct MsgMessage {
    pub header: MessageHeader,
    pub flags: u32,
    pub sections: Vec<Section>,
    /// Carried through as received; never verified.
    pub checksum: Option<u32>,
}

impl MsgMessage {
    /// The single kind-0 section.
    pub fn body(&self) -> Option<&WireDocument> {
        self.sections.iter().find_map(|section| match section {
            Section::Body(doc) => Some(doc),
            Section::DocumentSequence { .. } => None,
        })
    }
}

/// One OP_MSG section.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Kind 0: a single document.
    Body(WireDocument),
    /// Kind 1: a named list of documents.
    DocumentSequence {
        identifier: String,
        documents: Vec<WireDocument>,
    },
}

impl Section {
    fn decode(src: &mut BytesMut) -> Result<Self, ProtocolError> {
        let kind = src.get_u8();
        match kind {
            0 => Ok(Section::Body(get_document(src)?)),
            1 => {
                ensure_remaining!(src, 4, "section size");
                let size = src.get_i32_le();
                // The size covers itself
                if size < 4 || (size - 4) as usize > src.len() {
                    return Err(ProtocolError::InvalidMessage("section size out of bounds"));
                }
                let mut payload = src.split_to((size - 4) as usize);
                let identifier = get_cstring(&mut payload)?;
                let documents = get_documents(&mut payload)?;
                Ok(Section::DocumentSequence {
                    identifier,
                    documents,
                })
            }
            _ => Err(ProtocolError::UnknownSectionKind(kind)),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Section::Body(doc) => {
                dst.put_u8(0);
                put_document(dst, doc);
            }
            Section::DocumentSequence {
                identifier,
                documents,
            } => {
                dst.put_u8(1);
                let size = 4
                    + identifier.len()
                    + 1
                    + documents.iter().map(WireDocument::len).sum::<usize>();
                dst.put_i32_le(size as i32);
                put_cstring(dst, identifier);
                for doc in documents {
                    put_document(dst, doc);
                }
            }
        }
    }
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Reply(m) => &m.header,
            Message::Update(m) => &m.header,
            Message::Insert(m) => &m.header,
            Message::Query(m) => &m.header,
            Message::GetMore(m) => &m.header,
            Message::Delete(m) => &m.header,
            Message::KillCursors(m) => &m.header,
            Message::Command(m) => &m.header,
            Message::CommandReply(m) => &m.header,
            Message::Msg(m) => &m.header,
        }
    }

    pub fn op_code(&self) -> OpCode {
        self.header().op_code
    }

    /// Decodes the body that follows `header`.
    /// `src` must hold exactly the rest of the frame.
    pub(crate) fn decode_body(
        header: MessageHeader,
        src: &mut BytesMut,
    ) -> Result<Self, ProtocolError> {
        let message = match header.op_code {
            OpCode::Reply => {
                ensure_remaining!(src, 20, "reply fields");
                let response_flags = src.get_i32_le();
                let cursor_id = src.get_i64_le();
                let starting_from = src.get_i32_le();
                let number_returned = src.get_i32_le();
                let documents = get_documents(src)?;
                if documents.len() != number_returned.max(0) as usize {
                    return Err(ProtocolError::InvalidMessage(
                        "numberReturned does not match documents",
                    ));
                }
                Message::Reply(ReplyMessage {
                    header,
                    response_flags,
                    cursor_id,
                    starting_from,
                    number_returned,
                    documents,
                })
            }
            OpCode::Update => {
                ensure_remaining!(src, 4, "reserved field");
                src.advance(4);
                let full_collection_name = get_cstring(src)?;
                ensure_remaining!(src, 4, "update flags");
                let flags = src.get_i32_le();
                let selector = get_document(src)?;
                let update = get_document(src)?;
                Message::Update(UpdateMessage {
                    header,
                    full_collection_name,
                    flags,
                    selector,
                    update,
                })
            }
            OpCode::Insert => {
                ensure_remaining!(src, 4, "insert flags");
                let flags = src.get_i32_le();
                let full_collection_name = get_cstring(src)?;
                let documents = get_documents(src)?;
                Message::Insert(InsertMessage {
                    header,
                    flags,
                    full_collection_name,
                    documents,
                })
            }
            OpCode::Query => {
                ensure_remaining!(src, 4, "query flags");
                let flags = src.get_i32_le();
                let full_collection_name = get_cstring(src)?;
                ensure_remaining!(src, 8, "skip and return counts");
                let number_to_skip = src.get_i32_le();
                let number_to_return = src.get_i32_le();
                let query = get_document(src)?;
                let return_fields_selector = if src.is_empty() {
                    None
                } else {
                    Some(get_document(src)?)
                };
                Message::Query(QueryMessage {
                    header,
                    flags,
                    full_collection_name,
                    number_to_skip,
                    number_to_return,
                    query,
                    return_fields_selector,
                })
            }
            OpCode::GetMore => {
                ensure_remaining!(src, 4, "reserved field");
                src.advance(4);
                let full_collection_name = get_cstring(src)?;
                ensure_remaining!(src, 12, "getMore fields");
                let number_to_return = src.get_i32_le();
                let cursor_id = src.get_i64_le();
                Message::GetMore(GetMoreMessage {
                    header,
                    full_collection_name,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::Delete => {
                ensure_remaining!(src, 4, "reserved field");
                src.advance(4);
                let full_collection_name = get_cstring(src)?;
                ensure_remaining!(src, 4, "delete flags");
                let flags = src.get_i32_le();
                let selector = get_document(src)?;
                Message::Delete(DeleteMessage {
                    header,
                    full_collection_name,
                    flags,
                    selector,
                })
            }
            OpCode::KillCursors => {
                ensure_remaining!(src, 8, "cursor count");
                src.advance(4);
                let count = src.get_i32_le();
                if count < 0 {
                    return Err(ProtocolError::InvalidMessage("negative cursor count"));
                }
                ensure_remaining!(src, count as usize * 8, "cursor ids");
                let cursor_ids = (0..count).map(|_| src.get_i64_le()).collect();
                Message::KillCursors(KillCursorsMessage { header, cursor_ids })
            }
            OpCode::Command => {
                let database = get_cstring(src)?;
                let command_name = get_cstring(src)?;
                let metadata = get_document(src)?;
                let command_args = get_document(src)?;
                let input_docs = get_documents(src)?;
                Message::Command(CommandMessage {
                    header,
                    database,
                    command_name,
                    metadata,
                    command_args,
                    input_docs,
                })
            }
            OpCode::CommandReply => {
                let command_reply = get_document(src)?;
                let metadata = get_document(src)?;
                let output_docs = get_documents(src)?;
                Message::CommandReply(CommandReplyMessage {
                    header,
                    command_reply,
                    metadata,
                    output_docs,
                })
            }
            OpCode::Msg => {
                ensure_remaining!(src, 4, "OP_MSG flags");
                let flags = src.get_u32_le();
                let checksum = if flags & msg_flags::CHECKSUM_PRESENT != 0 {
                    ensure_remaining!(src, 4, "OP_MSG checksum");
                    let mut tail = src.split_off(src.len() - 4);
                    Some(tail.get_u32_le())
                } else {
                    None
                };

                let mut sections = Vec::new();
                while !src.is_empty() {
                    sections.push(Section::decode(src)?);
                }
                let bodies = sections
                    .iter()
                    .filter(|s| matches!(s, Section::Body(_)))
                    .count();
                if bodies != 1 {
                    return Err(ProtocolError::InvalidMessage(
                        "OP_MSG must contain exactly one body section",
                    ));
                }
                Message::Msg(MsgMessage {
                    header,
                    flags,
                    sections,
                    checksum,
                })
            }
        };

        if !src.is_empty() {
            return Err(ProtocolError::InvalidMessage("trailing bytes after message body"));
        }
        Ok(message)
    }

    /// Writes the body (everything after the header).
    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Message::Reply(m) => {
                dst.put_i32_le(m.response_flags);
                dst.put_i64_le(m.cursor_id);
                dst.put_i32_le(m.starting_from);
                dst.put_i32_le(m.number_returned);
                for doc in &m.documents {
                    put_document(dst, doc);
                }
            }
            Message::Update(m) => {
                dst.put_i32_le(0);
                put_cstring(dst, &m.full_collection_name);
                dst.put_i32_le(m.flags);
                put_document(dst, &m.selector);
                put_document(dst, &m.update);
            }
            Message::Insert(m) => {
                dst.put_i32_le(m.flags);
                put_cstring(dst, &m.full_collection_name);
                for doc in &m.documents {
                    put_document(dst, doc);
                }
            }
            Message::Query(m) => {
                dst.put_i32_le(m.flags);
                put_cstring(dst, &m.full_collection_name);
                dst.put_i32_le(m.number_to_skip);
                dst.put_i32_le(m.number_to_return);
                put_document(dst, &m.query);
                if let Some(selector) = &m.return_fields_selector {
                    put_document(dst, selector);
                }
            }
            Message::GetMore(m) => {
                dst.put_i32_le(0);
                put_cstring(dst, &m.full_collection_name);
                dst.put_i32_le(m.number_to_return);
                dst.put_i64_le(m.cursor_id);
            }
            Message::Delete(m) => {
                dst.put_i32_le(0);
                put_cstring(dst, &m.full_collection_name);
                dst.put_i32_le(m.flags);
                put_document(dst, &m.selector);
            }
            Message::KillCursors(m) => {
                dst.put_i32_le(0);
                dst.put_i32_le(m.cursor_ids.len() as i32);
                for id in &m.cursor_ids {
                    dst.put_i64_le(*id);
                }
            }
            Message::Command(m) => {
                put_cstring(dst, &m.database);
                put_cstring(dst, &m.command_name);
                put_document(dst, &m.metadata);
                put_document(dst, &m.command_args);
                for doc in &m.input_docs {
                    put_document(dst, doc);
                }
            }
            Message::CommandReply(m) => {
                put_document(dst, &m.command_reply);
                put_document(dst, &m.metadata);
                for doc in &m.output_docs {
                    put_document(dst, doc);
                }
            }
            Message::Msg(m) => {
                dst.put_u32_le(m.flags);
                for section in &m.sections {
                    section.encode(dst);
                }
                if let Some(checksum) = m.checksum {
                    dst.put_u32_le(checksum);
                }
            }
        }
    }
}
