//! MongoDB wire protocol framing and opcode body codec.
//!
//! The read side performs exact-length framed reads: a fixed 16-byte
//! header, then exactly `messageLength - 16` body bytes. All integers are
//! little-endian; c-strings are bytes up to and including the first NUL,
//! decoded as strict UTF-8.

use std::collections::HashMap;
use std::io::Cursor;

use bson::Document;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

/// Bit layout for OP_QUERY's flags field.
pub mod query_flags {
    pub const TAILABLE_CURSOR: u32 = 2;
    pub const SLAVE_OKAY: u32 = 4;
    pub const OPLOG_REPLAY: u32 = 8;
    pub const NO_TIMEOUT: u32 = 16;
    pub const AWAIT_DATA: u32 = 32;
    pub const EXHAUST: u32 = 64;
    pub const PARTIAL: u32 = 128;
}

/// Bit layout for OP_UPDATE's flags field.
pub mod update_flags {
    pub const UPSERT: u32 = 1;
    pub const MULTI_UPDATE: u32 = 2;
}

/// Bit layout for OP_INSERT's flags field.
pub mod insert_flags {
    pub const CONTINUE_ON_ERROR: u32 = 1;
}

/// Bit layout for OP_DELETE's flags field.
pub mod delete_flags {
    pub const SINGLE_REMOVE: u32 = 1;
}

/// Bit layout for an outbound OP_REPLY's responseFlags field.
pub mod reply_flags {
    pub const CURSOR_NOT_FOUND: u32 = 1;
    pub const QUERY_FAILURE: u32 = 2;
}

/// The 16-byte frame header common to every opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub const LEN: usize = 16;

    pub fn parse(buf: &[u8; Self::LEN]) -> Self {
        Self {
            message_length: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            request_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            response_to: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            op_code: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

/// The parsed body of one opcode-specific request, before it's lifted into
/// a typed `Request` (see `crate::message`).
#[derive(Debug, Clone)]
pub enum RawBody {
    Query {
        flags: u32,
        full_collection_name: String,
        num_to_skip: i32,
        num_to_return: i32,
        query: Document,
        fields: Option<Document>,
    },
    LegacyWrite {
        op_code: i32,
        flags: u32,
        full_collection_name: String,
        docs: Vec<Document>,
    },
    GetMore {
        full_collection_name: String,
        num_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
    Msg {
        flags: u32,
        doc: Document,
        doc_sequences: HashMap<String, Vec<Document>>,
        checksum: Option<u32>,
    },
}

/// One complete inbound message: header plus decoded body.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub header: MessageHeader,
    pub body: RawBody,
}

/// Read exactly one framed message from `stream`.
///
/// Returns `Err(Error::Io(..))` on disconnect or short read; callers should
/// treat any I/O error here as ordinary connection termination, not a
/// reportable failure (see the network-error clause in the error design).
pub async fn read_message<R>(stream: &mut R) -> Result<RawMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; MessageHeader::LEN];
    stream.read_exact(&mut header_buf).await?;
    let header = MessageHeader::parse(&header_buf);

    let body_len = header.message_length as usize - MessageHeader::LEN;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;

    tracing::trace!(op_code = header.op_code, len = body_len, "read frame");
    let body = decode_body(header.op_code, &body)?;
    Ok(RawMessage { header, body })
}

fn decode_body(op_code: i32, body: &[u8]) -> Result<RawBody> {
    match op_code {
        OP_QUERY => decode_op_query(body),
        OP_INSERT | OP_UPDATE | OP_DELETE => decode_legacy_write(op_code, body),
        OP_GET_MORE => decode_op_get_more(body),
        OP_KILL_CURSORS => decode_op_kill_cursors(body),
        OP_MSG => decode_op_msg(body),
        other => Err(Error::UnsupportedOpcode(other)),
    }
}

fn read_u32(body: &[u8], pos: usize) -> Result<u32> {
    let bytes: [u8; 4] = body
        .get(pos..pos + 4)
        .ok_or_else(|| Error::WireParse("truncated int32".into()))?
        .try_into()
        .unwrap();
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32(body: &[u8], pos: usize) -> Result<i32> {
    read_u32(body, pos).map(|v| v as i32)
}

fn read_i64(body: &[u8], pos: usize) -> Result<i64> {
    let bytes: [u8; 8] = body
        .get(pos..pos + 8)
        .ok_or_else(|| Error::WireParse("truncated int64".into()))?
        .try_into()
        .unwrap();
    Ok(i64::from_le_bytes(bytes))
}

/// Read a c-string (bytes up to and including the first NUL) starting at
/// `pos`. Returns the decoded string and the position just past the NUL.
fn read_cstring(body: &[u8], pos: usize) -> Result<(String, usize)> {
    let end = body
        .get(pos..)
        .ok_or_else(|| Error::WireParse("c-string starts past end of buffer".into()))?
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::WireParse("unterminated c-string".into()))?
        + pos;
    let s = std::str::from_utf8(&body[pos..end])
        .map_err(|e| Error::WireParse(format!("c-string is not valid utf-8: {e}")))?
        .to_string();
    Ok((s, end + 1))
}

fn decode_one_document(body: &[u8], pos: usize) -> Result<(Document, usize)> {
    let slice = body
        .get(pos..)
        .ok_or_else(|| Error::WireParse("document starts past end of buffer".into()))?;
    let mut cursor = Cursor::new(slice);
    let doc = Document::from_reader(&mut cursor)
        .map_err(|e| Error::WireParse(format!("invalid BSON document: {e}")))?;
    Ok((doc, pos + cursor.position() as usize))
}

fn decode_all_documents(body: &[u8], mut pos: usize) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    while pos < body.len() {
        let (doc, next) = decode_one_document(body, pos)?;
        docs.push(doc);
        pos = next;
    }
    Ok(docs)
}

fn decode_op_query(body: &[u8]) -> Result<RawBody> {
    let flags = read_u32(body, 0)?;
    let (full_collection_name, pos) = read_cstring(body, 4)?;
    let num_to_skip = read_i32(body, pos)?;
    let num_to_return = read_i32(body, pos + 4)?;
    let mut docs = decode_all_documents(body, pos + 8)?.into_iter();
    let query = docs.next().unwrap_or_default();
    let fields = docs.next();
    if docs.next().is_some() {
        return Err(Error::WireParse("OP_QUERY has too many documents".into()));
    }
    Ok(RawBody::Query {
        flags,
        full_collection_name,
        num_to_skip,
        num_to_return,
        query,
        fields,
    })
}

fn decode_legacy_write(op_code: i32, body: &[u8]) -> Result<RawBody> {
    let flags = read_u32(body, 0)?;
    let (full_collection_name, pos) = read_cstring(body, 4)?;
    let docs = decode_all_documents(body, pos)?;
    Ok(RawBody::LegacyWrite {
        op_code,
        flags,
        full_collection_name,
        docs,
    })
}

fn decode_op_get_more(body: &[u8]) -> Result<RawBody> {
    // Leading int32 is reserved.
    let (full_collection_name, pos) = read_cstring(body, 4)?;
    let num_to_return = read_i32(body, pos)?;
    let cursor_id = read_i64(body, pos + 4)?;
    Ok(RawBody::GetMore {
        full_collection_name,
        num_to_return,
        cursor_id,
    })
}

fn decode_op_kill_cursors(body: &[u8]) -> Result<RawBody> {
    // Leading int32 is reserved.
    let num_cursor_ids = read_i32(body, 4)? as usize;
    let mut cursor_ids = Vec::with_capacity(num_cursor_ids);
    let mut pos = 8;
    for _ in 0..num_cursor_ids {
        cursor_ids.push(read_i64(body, pos)?);
        pos += 8;
    }
    Ok(RawBody::KillCursors { cursor_ids })
}

const MSG_CHECKSUM_PRESENT: u32 = 1;

fn decode_op_msg(body: &[u8]) -> Result<RawBody> {
    let flags = read_u32(body, 0)?;
    let checksum_present = flags & MSG_CHECKSUM_PRESENT != 0;
    let end = if checksum_present {
        body.len()
            .checked_sub(4)
            .ok_or_else(|| Error::WireParse("OP_MSG too short for checksum".into()))?
    } else {
        body.len()
    };

    let mut pos = 4;
    let mut doc: Option<Document> = None;
    let mut doc_sequences: HashMap<String, Vec<Document>> = HashMap::new();

    while pos < end {
        let kind = *body
            .get(pos)
            .ok_or_else(|| Error::WireParse("truncated OP_MSG section kind".into()))?;
        pos += 1;
        match kind {
            0 => {
                let (d, next) = decode_one_document(body, pos)?;
                doc = Some(d);
                pos = next;
            }
            1 => {
                let size = read_i32(body, pos)? as usize;
                let section_start = pos;
                pos += 4;
                let (identifier, next) = read_cstring(body, pos)?;
                pos = next;
                let mut docs = Vec::new();
                let section_end = section_start + size;
                while pos < section_end {
                    let (d, next) = decode_one_document(body, pos)?;
                    docs.push(d);
                    pos = next;
                }
                doc_sequences.insert(identifier, docs);
            }
            other => {
                return Err(Error::WireParse(format!(
                    "unsupported OP_MSG section kind {other}"
                )));
            }
        }
    }

    let checksum = if checksum_present {
        Some(read_u32(body, end)?)
    } else {
        None
    };

    let doc = doc.ok_or_else(|| Error::WireParse("OP_MSG has no kind-0 section".into()))?;
    Ok(RawBody::Msg {
        flags,
        doc,
        doc_sequences,
        checksum,
    })
}

fn random_request_id() -> i32 {
    rand::thread_rng().gen_range(0..=1_000_000)
}

/// Encode a legacy OP_REPLY carrying `docs`.
pub fn encode_op_reply(
    docs: &[Document],
    response_to: i32,
    flags: u32,
    cursor_id: i64,
    starting_from: i32,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.extend_from_slice(&flags.to_le_bytes());
    data.extend_from_slice(&cursor_id.to_le_bytes());
    data.extend_from_slice(&starting_from.to_le_bytes());
    data.extend_from_slice(&(docs.len() as i32).to_le_bytes());
    for doc in docs {
        let bytes = bson::to_vec(doc)
            .map_err(|e| Error::BadSpec(format!("failed to encode reply document: {e}")))?;
        data.extend_from_slice(&bytes);
    }

    let header = MessageHeader {
        message_length: (MessageHeader::LEN + data.len()) as i32,
        request_id: random_request_id(),
        response_to,
        op_code: OP_REPLY,
    };
    let mut out = Vec::with_capacity(header.message_length as usize);
    header.write_to(&mut out);
    out.extend_from_slice(&data);
    Ok(out)
}

/// Encode an OP_MSG reply with a single kind-0 section.
pub fn encode_op_msg_reply(doc: &Document, response_to: i32) -> Result<Vec<u8>> {
    encode_op_msg(doc, random_request_id(), response_to)
}

/// Encode a single-kind-0-section OP_MSG carrying `doc`. Used both to
/// frame outbound replies and, in tests, to construct client requests for
/// round-trip coverage — the wire shape is identical either direction.
pub fn encode_op_msg(doc: &Document, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
    let doc_bytes = bson::to_vec(doc)
        .map_err(|e| Error::BadSpec(format!("failed to encode document: {e}")))?;
    let flags: u32 = 0;
    let body_len = 4 + 1 + doc_bytes.len();

    let header = MessageHeader {
        message_length: (MessageHeader::LEN + body_len) as i32,
        request_id,
        response_to,
        op_code: OP_MSG,
    };
    let mut out = Vec::with_capacity(header.message_length as usize);
    header.write_to(&mut out);
    out.extend_from_slice(&flags.to_le_bytes());
    out.push(0u8);
    out.extend_from_slice(&doc_bytes);
    Ok(out)
}

/// Encode an OP_QUERY request. Exposed alongside the decoder mainly so
/// tests can construct client requests without hand-building bytes.
pub fn encode_op_query(
    full_collection_name: &str,
    query: &Document,
    flags: u32,
    num_to_skip: i32,
    num_to_return: i32,
) -> Result<Vec<u8>> {
    let query_bytes =
        bson::to_vec(query).map_err(|e| Error::BadSpec(format!("failed to encode query: {e}")))?;

    let mut data = Vec::new();
    data.extend_from_slice(&flags.to_le_bytes());
    data.extend_from_slice(full_collection_name.as_bytes());
    data.push(0);
    data.extend_from_slice(&num_to_skip.to_le_bytes());
    data.extend_from_slice(&num_to_return.to_le_bytes());
    data.extend_from_slice(&query_bytes);

    let header = MessageHeader {
        message_length: (MessageHeader::LEN + data.len()) as i32,
        request_id: random_request_id(),
        response_to: 0,
        op_code: OP_QUERY,
    };
    let mut out = Vec::with_capacity(header.message_length as usize);
    header.write_to(&mut out);
    out.extend_from_slice(&data);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn header_round_trip() {
        let header = MessageHeader {
            message_length: 42,
            request_id: 7,
            response_to: 0,
            op_code: OP_MSG,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        let parsed = MessageHeader::parse(&buf.try_into().unwrap());
        assert_eq!(parsed, header);
    }

    #[test]
    fn decode_op_query_with_command_namespace() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(b"admin.$cmd\0");
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&bson::to_vec(&doc! {"ismaster": 1}).unwrap());

        let parsed = decode_body(OP_QUERY, &body).unwrap();
        match parsed {
            RawBody::Query {
                full_collection_name,
                query,
                fields,
                ..
            } => {
                assert_eq!(full_collection_name, "admin.$cmd");
                assert_eq!(query, doc! {"ismaster": 1});
                assert!(fields.is_none());
            }
            _ => panic!("expected Query"),
        }
    }

    #[test]
    fn decode_op_msg_with_checksum_and_db() {
        let doc = doc! {"foo": 1, "$db": "mydb"};
        let doc_bytes = bson::to_vec(&doc).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes()); // checksumPresent
        body.push(0u8);
        body.extend_from_slice(&doc_bytes);
        body.extend_from_slice(&1234u32.to_le_bytes());

        let parsed = decode_body(OP_MSG, &body).unwrap();
        match parsed {
            RawBody::Msg {
                flags,
                doc: parsed_doc,
                checksum,
                ..
            } => {
                assert_eq!(flags, 1);
                assert_eq!(parsed_doc, doc);
                assert_eq!(checksum, Some(1234));
            }
            _ => panic!("expected Msg"),
        }
    }

    #[test]
    fn decode_op_msg_with_document_sequence() {
        let cmd_doc = doc! {"insert": "coll", "$db": "mydb"};
        let cmd_bytes = bson::to_vec(&cmd_doc).unwrap();
        let seq_doc = doc! {"_id": 1};
        let seq_bytes = bson::to_vec(&seq_doc).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0u8);
        body.extend_from_slice(&cmd_bytes);

        body.push(1u8);
        let identifier = b"documents\0";
        let size = 4 + identifier.len() as i32 + seq_bytes.len() as i32;
        body.extend_from_slice(&size.to_le_bytes());
        body.extend_from_slice(identifier);
        body.extend_from_slice(&seq_bytes);

        let parsed = decode_body(OP_MSG, &body).unwrap();
        match parsed {
            RawBody::Msg { doc_sequences, .. } => {
                assert_eq!(doc_sequences.get("documents").unwrap(), &vec![seq_doc]);
            }
            _ => panic!("expected Msg"),
        }
    }

    #[test]
    fn unsupported_opcode_is_rejected() {
        let err = decode_body(9999, &[]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOpcode(9999)));
    }

    #[test]
    fn op_query_round_trips_through_encode_and_decode() {
        let query = doc! {"x": 1};
        let bytes = encode_op_query("test.coll", &query, 0, 0, 100).unwrap();
        let header = MessageHeader::parse(&bytes[..16].try_into().unwrap());
        let decoded = decode_body(header.op_code, &bytes[16..]).unwrap();
        match decoded {
            RawBody::Query {
                full_collection_name,
                query: decoded_query,
                num_to_return,
                ..
            } => {
                assert_eq!(full_collection_name, "test.coll");
                assert_eq!(decoded_query, query);
                assert_eq!(num_to_return, 100);
            }
            _ => panic!("expected Query"),
        }
    }

    #[test]
    fn op_msg_round_trips_through_encode_and_decode() {
        let doc = doc! {"ping": 1, "$db": "admin"};
        let bytes = encode_op_msg(&doc, 7, 0).unwrap();
        let header = MessageHeader::parse(&bytes[..16].try_into().unwrap());
        assert_eq!(header.request_id, 7);
        let decoded = decode_body(header.op_code, &bytes[16..]).unwrap();
        match decoded {
            RawBody::Msg { doc: decoded_doc, .. } => assert_eq!(decoded_doc, doc),
            _ => panic!("expected Msg"),
        }
    }
}
