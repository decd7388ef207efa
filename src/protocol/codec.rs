use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::document::{MIN_DOCUMENT_LEN, WireDocument};
use crate::protocol::header::{HEADER_LEN, MessageHeader};
use crate::protocol::message::Message;
use crate::protocol::ProtocolError;

/// Maximum message size in bytes (48 MB), matching `maxMessageSizeBytes` of
/// current MongoDB servers.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Ensures that the buffer has at least `n` bytes remaining.
/// Returns `ProtocolError::Truncated` naming the field if not.
macro_rules! ensure_remaining {
    ($buf:expr, $n:expr, $field:expr) => {
        if $buf.len() < $n {
            return Err(ProtocolError::Truncated($field));
        }
    };
}
pub(crate) use ensure_remaining;

/// Read a null-terminated string from a BytesMut buffer.
/// Returns the string (without the null terminator) if successful.
///
/// Strings longer than 64 KiB are rejected as truncated.
pub fn get_cstring(src: &mut BytesMut) -> Result<String, ProtocolError> {
    const MAX_CSTRING_LENGTH: usize = 64 * 1024;

    let Some(null_pos) = src.iter().take(MAX_CSTRING_LENGTH).position(|&b| b == 0) else {
        return Err(ProtocolError::Truncated("cstring terminator"));
    };

    let bytes = src.split_to(null_pos);
    src.advance(1);
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Write a null-terminated string to a BytesMut buffer.
pub fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Read one BSON document from the front of the buffer.
pub fn get_document(src: &mut BytesMut) -> Result<WireDocument, ProtocolError> {
    ensure_remaining!(src, 4, "document length");
    let len = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    if len < MIN_DOCUMENT_LEN as i32 || len as usize > src.len() {
        return Err(ProtocolError::InvalidMessage("document length out of bounds"));
    }
    let bytes = src.split_to(len as usize).freeze();
    Ok(WireDocument::from_bytes(bytes)?)
}

/// Read documents until the buffer is exhausted.
pub fn get_documents(src: &mut BytesMut) -> Result<Vec<WireDocument>, ProtocolError> {
    let mut documents = Vec::new();
    while !src.is_empty() {
        documents.push(get_document(src)?);
    }
    Ok(documents)
}

pub fn put_document(dst: &mut BytesMut, doc: &WireDocument) {
    dst.put_slice(doc.as_bytes());
}

/// Codec for MongoDB wire messages.
///
/// The same codec serves both directions: it decodes any supported opcode
/// and encodes any [`Message`], so it can drive a server socket as well as
/// a test client.
#[derive(Debug)]
pub struct MongoCodec {
    pub(crate) max_message_size: usize,
}

impl MongoCodec {
    /// Creates a new MongoCodec with the default maximum message size.
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Creates a codec that rejects frames longer than `max_message_size`.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for MongoCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MongoCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length (don't consume yet)
        let len = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if len < HEADER_LEN as i32 || len as usize > self.max_message_size {
            return Err(ProtocolError::InvalidLength(len));
        }

        // Wait for complete message
        let len = len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        let header = MessageHeader::decode(&mut frame)?;
        let message = Message::decode_body(header, &mut frame)?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for MongoCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        item.header().encode(0, dst);
        item.encode_body(dst);

        let len = dst.len() - start;
        if len > self.max_message_size {
            dst.truncate(start);
            return Err(ProtocolError::InvalidLength(
                i32::try_from(len).unwrap_or(i32::MAX),
            ));
        }
        dst[start..start + 4].copy_from_slice(&(len as i32).to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MsgMessage, QueryMessage, Section};
    use crate::protocol::OpCode;
    use bson::doc;

    fn wire(doc: bson::Document) -> WireDocument {
        WireDocument::from_document(&doc).unwrap()
    }

    /// Builds a raw frame: header with computed length, then `body`.
    fn frame(request_id: i32, op_code: i32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32_le((HEADER_LEN + body.len()) as i32);
        buf.put_i32_le(request_id);
        buf.put_i32_le(0);
        buf.put_i32_le(op_code);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn test_get_cstring() {
        let mut buf = BytesMut::from(&b"admin.$cmd\0rest"[..]);
        assert_eq!(get_cstring(&mut buf).unwrap(), "admin.$cmd");
        assert_eq!(buf, b"rest"[..]);
    }

    #[test]
    fn test_get_cstring_incomplete() {
        let mut buf = BytesMut::from(&b"admin"[..]);
        assert!(matches!(
            get_cstring(&mut buf),
            Err(ProtocolError::Truncated(_))
        ));
    }

    #[test]
    fn test_get_document_overrun() {
        // Declares 32 bytes, only 5 present
        let mut buf = BytesMut::from(&[32, 0, 0, 0, 0][..]);
        assert!(get_document(&mut buf).is_err());
    }

    #[test]
    fn test_decode_op_query() {
        let query = wire(doc! { "isMaster": 1 });
        let mut body = BytesMut::new();
        body.put_i32_le(0); // flags
        put_cstring(&mut body, "admin.$cmd");
        body.put_i32_le(0); // skip
        body.put_i32_le(-1); // return
        put_document(&mut body, &query);

        let mut buf = frame(42, OpCode::Query.as_i32(), &body);
        let message = MongoCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());

        let Message::Query(QueryMessage {
            header,
            full_collection_name,
            number_to_return,
            query: decoded,
            return_fields_selector,
            ..
        }) = message
        else {
            panic!("expected OP_QUERY");
        };
        assert_eq!(header.request_id, 42);
        assert_eq!(full_collection_name, "admin.$cmd");
        assert_eq!(number_to_return, -1);
        assert_eq!(decoded, query);
        assert!(return_fields_selector.is_none());
    }

    #[test]
    fn test_decode_op_msg_with_sequence() {
        let body_doc = wire(doc! { "insert": "coll", "$db": "test" });
        let first = wire(doc! { "_id": 1 });
        let second = wire(doc! { "_id": 2 });

        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u8(0);
        put_document(&mut body, &body_doc);
        body.put_u8(1);
        body.put_i32_le((4 + "documents".len() + 1 + first.len() + second.len()) as i32);
        put_cstring(&mut body, "documents");
        put_document(&mut body, &first);
        put_document(&mut body, &second);

        let mut buf = frame(9, OpCode::Msg.as_i32(), &body);
        let message = MongoCodec::new().decode(&mut buf).unwrap().unwrap();

        let Message::Msg(msg) = message else {
            panic!("expected OP_MSG");
        };
        assert_eq!(msg.body(), Some(&body_doc));
        assert_eq!(msg.sections.len(), 2);
        assert_eq!(
            msg.sections[1],
            Section::DocumentSequence {
                identifier: "documents".to_string(),
                documents: vec![first, second],
            }
        );
        assert_eq!(msg.checksum, None);
    }

    #[test]
    fn test_decode_op_msg_with_checksum() {
        let body_doc = wire(doc! { "ping": 1 });
        let mut body = BytesMut::new();
        body.put_u32_le(crate::protocol::msg_flags::CHECKSUM_PRESENT);
        body.put_u8(0);
        put_document(&mut body, &body_doc);
        body.put_u32_le(0xDEADBEEF);

        let mut buf = frame(1, OpCode::Msg.as_i32(), &body);
        let Some(Message::Msg(msg)) = MongoCodec::new().decode(&mut buf).unwrap() else {
            panic!("expected OP_MSG");
        };
        assert_eq!(msg.checksum, Some(0xDEADBEEF));
        assert_eq!(msg.body(), Some(&body_doc));
    }

    #[test]
    fn test_decode_op_msg_requires_single_body() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u8(0);
        put_document(&mut body, &wire(doc! { "a": 1 }));
        body.put_u8(0);
        put_document(&mut body, &wire(doc! { "b": 1 }));

        let mut buf = frame(1, OpCode::Msg.as_i32(), &body);
        assert!(matches!(
            MongoCodec::new().decode(&mut buf),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u8(0);
        put_document(&mut body, &wire(doc! { "ping": 1 }));
        let full = frame(3, OpCode::Msg.as_i32(), &body);

        let mut codec = MongoCodec::new();
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(8);
        buf.put_i32_le(0);
        assert!(matches!(
            MongoCodec::new().decode(&mut buf),
            Err(ProtocolError::InvalidLength(8))
        ));

        let mut buf = BytesMut::new();
        buf.put_i32_le(1024);
        let mut codec = MongoCodec::with_max_message_size(512);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidLength(1024))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut buf = frame(1, 2012, &[0; 9]);
        assert!(matches!(
            MongoCodec::new().decode(&mut buf),
            Err(ProtocolError::UnknownOpcode(2012))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut body = BytesMut::new();
        body.put_i32_le(0);
        put_cstring(&mut body, "test.coll");
        body.put_i32_le(10);
        body.put_i64_le(77);
        body.put_u8(0xFF);

        let mut buf = frame(1, OpCode::GetMore.as_i32(), &body);
        assert!(matches!(
            MongoCodec::new().decode(&mut buf),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_encode_computes_length() {
        let doc = wire(doc! { "ok": 1 });
        let message = Message::Msg(MsgMessage {
            header: MessageHeader::new(5, 4, OpCode::Msg),
            flags: 0,
            sections: vec![Section::Body(doc.clone())],
            checksum: None,
        });

        let mut buf = BytesMut::new();
        MongoCodec::new().encode(message, &mut buf).unwrap();

        let expected_len = HEADER_LEN + 4 + 1 + doc.len();
        assert_eq!(buf.len(), expected_len);
        assert_eq!(&buf[0..4], &(expected_len as i32).to_le_bytes());
        assert_eq!(&buf[4..8], &5i32.to_le_bytes());
        assert_eq!(&buf[8..12], &4i32.to_le_bytes());
        assert_eq!(&buf[12..16], &2013i32.to_le_bytes());
        assert_eq!(buf[20], 0); // section kind
        assert_eq!(&buf[21..], doc.as_bytes().as_ref());
    }

    #[test]
    fn test_encode_appends_after_existing_data() {
        let message = Message::Msg(MsgMessage {
            header: MessageHeader::new(1, 0, OpCode::Msg),
            flags: 0,
            sections: vec![Section::Body(WireDocument::empty())],
            checksum: None,
        });
        let mut buf = BytesMut::from(&b"xyz"[..]);
        MongoCodec::new().encode(message, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(&buf[3..7], &((buf.len() - 3) as i32).to_le_bytes());
    }
}
