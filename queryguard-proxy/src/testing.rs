//! Test doubles and wire helpers shared by unit and integration tests.
//!
//! [`StaticControl`] stands in for the cluster control channel the way a
//! scripted link stands in for a real transport: fixed counts and index
//! lists per namespace, canned opids, and recorders for the find/kill
//! traffic the overrun path generates.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bson::{Bson, Document};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use queryguard_domain::{ControlChannel, IndexSpec, Result};
use queryguard_wire::{
    // ---
    decode_document,
    encode_document,
    read_cstring,
    read_document_raw,
    read_header,
    MessageHeader,
    OpCode,
    HEADER_LEN,
    REPLY_PRELUDE_LEN,
};

// ---------------------------------------------------------------------------
// StaticControl
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticControl {
    // ---
    counts: HashMap<String, i64>,
    indexes: HashMap<String, Vec<IndexSpec>>,

    /// Opids returned by every `find_ops` call.
    ops: Vec<Bson>,

    /// Filters seen by `find_ops`, in call order.
    pub find_filters: Mutex<Vec<Document>>,

    /// Opids passed to `kill_op`, in call order.
    pub killed: Mutex<Vec<Bson>>,
}

// ---

impl StaticControl {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count(mut self, ns: &str, count: i64) -> Self {
        // ---
        self.counts.insert(ns.to_string(), count);
        self
    }

    pub fn with_indexes(mut self, ns: &str, indexes: Vec<IndexSpec>) -> Self {
        // ---
        self.indexes.insert(ns.to_string(), indexes);
        self
    }

    pub fn with_ops(mut self, ops: Vec<Bson>) -> Self {
        // ---
        self.ops = ops;
        self
    }

    /// One ascending single-key index, the common fixture.
    pub fn single_index(ns: &str, field: &str, count: i64) -> Self {
        // ---
        Self::new().with_count(ns, count).with_indexes(
            ns,
            vec![IndexSpec {
                name: format!("{field}_1"),
                keys: vec![field.to_string()],
            }],
        )
    }
}

// ---

#[async_trait]
impl ControlChannel for StaticControl {
    // ---

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexSpec>> {
        // ---
        let ns = format!("{database}.{collection}");
        Ok(self.indexes.get(&ns).cloned().unwrap_or_default())
    }

    async fn count_documents(&self, database: &str, collection: &str) -> Result<i64> {
        // ---
        let ns = format!("{database}.{collection}");
        Ok(self.counts.get(&ns).copied().unwrap_or(0))
    }

    async fn find_ops(&self, filter: Document) -> Result<Vec<Bson>> {
        // ---
        self.find_filters.lock().unwrap().push(filter);
        Ok(self.ops.clone())
    }

    async fn kill_op(&self, opid: Bson) -> Result<()> {
        // ---
        self.killed.lock().unwrap().push(opid);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Build one complete Query message.
pub fn query_message(request_id: i32, ns: &str, query: &Document) -> Vec<u8> {
    // ---
    query_message_with_tail(request_id, ns, query, &[])
}

/// Build a Query message with trailing bytes after the query document
/// (a returnFieldsSelector, as far as the relay is concerned).
pub fn query_message_with_tail(request_id: i32, ns: &str, query: &Document, tail: &[u8]) -> Vec<u8> {
    // ---
    let query_bytes = encode_document(query).unwrap();
    let mut ns_bytes = ns.as_bytes().to_vec();
    ns_bytes.push(0);

    let message_length = HEADER_LEN + 4 + ns_bytes.len() + 8 + query_bytes.len() + tail.len();
    let header = MessageHeader {
        message_length: message_length as i32,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    };

    let mut out = header.to_wire().to_vec();
    out.extend_from_slice(&0i32.to_le_bytes()); // flags
    out.extend_from_slice(&ns_bytes);
    out.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    out.extend_from_slice(&0i32.to_le_bytes()); // numberToReturn
    out.extend_from_slice(&query_bytes);
    out.extend_from_slice(tail);
    out
}

// ---

/// Build one complete Reply message answering `response_to`.
pub fn reply_message(response_to: i32, docs: &[Document]) -> Vec<u8> {
    // ---
    let bodies: Vec<Vec<u8>> = docs.iter().map(|d| encode_document(d).unwrap()).collect();
    let body_len: usize = bodies.iter().map(Vec::len).sum();

    let header = MessageHeader {
        message_length: (HEADER_LEN + REPLY_PRELUDE_LEN + body_len) as i32,
        request_id: 7000,
        response_to,
        op_code: OpCode::Reply,
    };

    let mut out = header.to_wire().to_vec();
    out.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
    out.extend_from_slice(&0i64.to_le_bytes()); // cursorID
    out.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    out.extend_from_slice(&(docs.len() as i32).to_le_bytes());
    for body in &bodies {
        out.extend_from_slice(body);
    }
    out
}

// ---

/// One Query read off a stream, field by field.
pub struct ParsedQuery {
    // ---
    pub header: MessageHeader,
    pub ns: String,
    pub query: Document,
    pub query_bytes: Vec<u8>,
    pub tail: Vec<u8>,
}

// ---

/// Read and split one Query message (for scripted-upstream assertions).
pub async fn read_query_message<R>(stream: &mut R) -> ParsedQuery
where
    R: AsyncRead + Unpin,
{
    // ---
    let header = read_header(stream).await.unwrap().unwrap();
    assert_eq!(header.op_code, OpCode::Query);

    let mut flags = [0u8; 4];
    stream.read_exact(&mut flags).await.unwrap();
    let ns_bytes = read_cstring(stream).await.unwrap();
    let mut skip_return = [0u8; 8];
    stream.read_exact(&mut skip_return).await.unwrap();
    let query_bytes = read_document_raw(stream).await.unwrap();

    let consumed = HEADER_LEN + 4 + ns_bytes.len() + 8 + query_bytes.len();
    let mut tail = vec![0u8; header.message_length as usize - consumed];
    stream.read_exact(&mut tail).await.unwrap();

    ParsedQuery {
        header,
        ns: String::from_utf8(ns_bytes[..ns_bytes.len() - 1].to_vec()).unwrap(),
        query: decode_document(&query_bytes).unwrap(),
        query_bytes,
        tail,
    }
}

// ---

/// Read one complete raw message (header + body) from a stream.
pub async fn read_full_message<R>(stream: &mut R) -> (MessageHeader, Vec<u8>)
where
    R: AsyncRead + Unpin,
{
    // ---
    let header = read_header(stream).await.unwrap().unwrap();
    let mut body = vec![0u8; header.body_len() as usize];
    stream.read_exact(&mut body).await.unwrap();

    let mut raw = header.to_wire().to_vec();
    raw.extend_from_slice(&body);
    (header, raw)
}

// ---

/// Split a raw Reply message into (header, prelude, first document).
pub fn split_reply(raw: &[u8]) -> (MessageHeader, &[u8], Document) {
    // ---
    let header = MessageHeader::from_wire(raw[..HEADER_LEN].try_into().unwrap()).unwrap();
    assert_eq!(header.op_code, OpCode::Reply);
    let prelude = &raw[HEADER_LEN..HEADER_LEN + REPLY_PRELUDE_LEN];
    let doc = decode_document(&raw[HEADER_LEN + REPLY_PRELUDE_LEN..]).unwrap();
    (header, prelude, doc)
}

// ---

/// Write all of `bytes` to a stream.
pub async fn send<W>(stream: &mut W, bytes: &[u8])
where
    W: AsyncWrite + Unpin,
{
    // ---
    stream.write_all(bytes).await.unwrap();
}
