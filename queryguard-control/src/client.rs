//! [`ClusterControl`] — pooled wire-protocol client for the control
//! channel.
//!
//! Every operation is a one-shot `Query` with a negative `numberToReturn`
//! so the server answers in a single reply and closes the cursor; no
//! cursor bookkeeping lives here. Commands target `<db>.$cmd`; the
//! operation list and kill-op go through the `admin.$cmd.sys.inprog` and
//! `admin.$cmd.sys.killop` virtual collections; index metadata is a
//! filtered read of `<db>.system.indexes`.

use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use queryguard_domain::{ControlChannel, GuardError, IndexSpec, Result};
use queryguard_wire::{
    // ---
    decode_document,
    dial_upstream,
    encode_document,
    read_document_raw,
    read_header,
    MessageHeader,
    OpCode,
    HEADER_LEN,
    REPLY_PRELUDE_LEN,
};

use super::auth::{auth_key, password_digest};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Idle connections kept for reuse; extras are dropped on release.
const POOL_IDLE_MAX: usize = 4;

/// One-shot batch size for index metadata. Negative so the server closes
/// the cursor after one reply; the magnitude comfortably covers the
/// server's 64-indexes-per-collection cap.
const INDEX_BATCH: i32 = -128;

/// Reply responseFlags bit: the query failed and the single returned
/// document carries `$err`.
const QUERY_FAILURE_FLAG: i32 = 2;

// ---------------------------------------------------------------------------
// ClusterControl
// ---------------------------------------------------------------------------

/// A pooled, optionally authenticated control-channel session.
pub struct ClusterControl {
    // ---
    servers: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    auth_db: String,

    pool: Mutex<Vec<TcpStream>>,
    request_id: AtomicI32,
}

// ---

impl ClusterControl {
    // ---

    /// Dial (and authenticate) one connection up front so startup fails
    /// fast on an unreachable cluster or bad credentials, then keep that
    /// connection pooled.
    pub async fn connect(
        servers: Vec<String>,
        username: Option<String>,
        password: Option<String>,
        auth_db: String,
    ) -> Result<Self> {
        // ---
        let control = Self {
            servers,
            username,
            password,
            auth_db,
            pool: Mutex::new(Vec::new()),
            request_id: AtomicI32::new(1),
        };

        let conn = control.dial().await?;
        control.pool.lock().await.push(conn);

        Ok(control)
    }

    // ---

    async fn dial(&self) -> Result<TcpStream> {
        // ---
        let mut stream = dial_upstream(&self.servers).await?;
        if let (Some(user), Some(pass)) = (self.username.clone(), self.password.clone()) {
            self.login(&mut stream, &user, &pass).await?;
        }
        Ok(stream)
    }

    async fn acquire(&self) -> Result<TcpStream> {
        // ---
        if let Some(conn) = self.pool.lock().await.pop() {
            return Ok(conn);
        }
        self.dial().await
    }

    async fn release(&self, conn: TcpStream) {
        // ---
        let mut pool = self.pool.lock().await;
        if pool.len() < POOL_IDLE_MAX {
            pool.push(conn);
        }
    }

    // ---

    /// Legacy handshake: `getnonce`, then `authenticate` with the
    /// nonce/digest proof.
    async fn login(&self, stream: &mut TcpStream, user: &str, password: &str) -> Result<()> {
        // ---
        let cmd_ns = format!("{}.$cmd", self.auth_db);

        let nonce_reply = self
            .one_shot_query(stream, &cmd_ns, -1, &doc! { "getnonce": 1i32 })
            .await
            .and_then(first_doc)
            .and_then(command_ok)?;
        let nonce = nonce_reply
            .get_str("nonce")
            .map_err(|_| GuardError::Control("getnonce reply carried no nonce".into()))?;

        let key = auth_key(nonce, user, &password_digest(user, password));
        self.one_shot_query(
            stream,
            &cmd_ns,
            -1,
            &doc! {
                "authenticate": 1i32,
                "user": user,
                "nonce": nonce,
                "key": key,
            },
        )
        .await
        .and_then(first_doc)
        .and_then(command_ok)
        .map_err(|e| GuardError::Control(format!("authentication as {user} failed: {e}")))?;

        Ok(())
    }

    // ---

    /// Send one `Query` and read its single reply.
    async fn one_shot_query(
        &self,
        stream: &mut TcpStream,
        ns: &str,
        number_to_return: i32,
        filter: &Document,
    ) -> Result<Vec<Document>> {
        // ---
        let request_id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let filter_bytes = encode_document(filter)?;

        let mut ns_bytes = ns.as_bytes().to_vec();
        ns_bytes.push(0);

        let message_length = HEADER_LEN + 4 + ns_bytes.len() + 8 + filter_bytes.len();
        let header = MessageHeader {
            message_length: message_length as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };

        let mut msg = Vec::with_capacity(message_length);
        msg.extend_from_slice(&header.to_wire());
        msg.extend_from_slice(&0i32.to_le_bytes()); // flags
        msg.extend_from_slice(&ns_bytes);
        msg.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
        msg.extend_from_slice(&number_to_return.to_le_bytes());
        msg.extend_from_slice(&filter_bytes);
        stream.write_all(&msg).await?;

        debug!(ns, request_id, "control query sent");

        let reply = read_header(stream).await?.ok_or_else(|| {
            GuardError::Control("control stream closed while awaiting a reply".into())
        })?;
        if reply.op_code != OpCode::Reply || reply.response_to != request_id {
            return Err(GuardError::Control(format!(
                "unexpected reply framing (op {:?}, responseTo {})",
                reply.op_code, reply.response_to
            )));
        }

        let mut prelude = [0u8; REPLY_PRELUDE_LEN];
        stream
            .read_exact(&mut prelude)
            .await
            .map_err(|e| GuardError::Framing(format!("short reply prelude: {e}")))?;
        let response_flags = i32::from_le_bytes(prelude[0..4].try_into().unwrap());
        let number_returned = i32::from_le_bytes(prelude[16..20].try_into().unwrap());
        if number_returned < 0 {
            return Err(GuardError::Framing(format!(
                "negative numberReturned {number_returned}"
            )));
        }

        let mut docs = Vec::with_capacity(number_returned as usize);
        for _ in 0..number_returned {
            let raw = read_document_raw(stream).await?;
            docs.push(decode_document(&raw)?);
        }

        if response_flags & QUERY_FAILURE_FLAG != 0 {
            let err = docs
                .first()
                .and_then(|d| d.get_str("$err").ok())
                .unwrap_or("query failure");
            return Err(GuardError::Control(err.to_string()));
        }

        Ok(docs)
    }

    // ---

    /// Check out a connection, run one query, return the connection on
    /// success. Failed connections are dropped, not pooled.
    async fn query_pooled(
        &self,
        ns: &str,
        number_to_return: i32,
        filter: &Document,
    ) -> Result<Vec<Document>> {
        // ---
        let mut conn = self.acquire().await?;
        match self.one_shot_query(&mut conn, ns, number_to_return, filter).await {
            Ok(docs) => {
                self.release(conn).await;
                Ok(docs)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
        // ---
        self.query_pooled(&format!("{database}.$cmd"), -1, &command)
            .await
            .and_then(first_doc)
            .and_then(command_ok)
    }
}

// ---------------------------------------------------------------------------
// ControlChannel impl
// ---------------------------------------------------------------------------

#[async_trait]
impl ControlChannel for ClusterControl {
    // ---

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexSpec>> {
        // ---
        let docs = self
            .query_pooled(
                &format!("{database}.system.indexes"),
                INDEX_BATCH,
                &doc! { "ns": format!("{database}.{collection}") },
            )
            .await?;

        Ok(docs.iter().filter_map(index_spec_from_doc).collect())
    }

    async fn count_documents(&self, database: &str, collection: &str) -> Result<i64> {
        // ---
        let reply = self.run_command(database, doc! { "count": collection }).await?;
        reply
            .get("n")
            .and_then(numeric)
            .map(|n| n as i64)
            .ok_or_else(|| GuardError::Control("count reply carried no n".into()))
    }

    async fn find_ops(&self, filter: Document) -> Result<Vec<Bson>> {
        // ---
        self.query_pooled("admin.$cmd.sys.inprog", -1, &filter)
            .await
            .and_then(first_doc)
            .and_then(parse_inprog)
    }

    async fn kill_op(&self, opid: Bson) -> Result<()> {
        // ---
        self.query_pooled("admin.$cmd.sys.killop", -1, &doc! { "op": opid })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reply shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InprogReply {
    // ---
    #[serde(default)]
    inprog: Vec<OpEntry>,
}

#[derive(Debug, Deserialize)]
struct OpEntry {
    // ---
    opid: Option<Bson>,
}

// ---

fn parse_inprog(reply: Document) -> Result<Vec<Bson>> {
    // ---
    let reply: InprogReply = bson::from_document(reply)
        .map_err(|e| GuardError::Control(format!("malformed inprog reply: {e}")))?;
    Ok(reply.inprog.into_iter().filter_map(|op| op.opid).collect())
}

// ---

/// Reduce one `system.indexes` document to an [`IndexSpec`]. The `key`
/// subdocument's field order is the index key order; negative values mark
/// descending keys.
fn index_spec_from_doc(doc: &Document) -> Option<IndexSpec> {
    // ---
    let key = doc.get_document("key").ok()?;
    let keys = key
        .iter()
        .map(|(field, direction)| match numeric(direction) {
            Some(d) if d < 0.0 => format!("-{field}"),
            _ => field.clone(),
        })
        .collect();

    Some(IndexSpec {
        name: doc.get_str("name").unwrap_or_default().to_string(),
        keys,
    })
}

// ---

fn numeric(value: &Bson) -> Option<f64> {
    // ---
    match value {
        Bson::Double(d) => Some(*d),
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

fn first_doc(docs: Vec<Document>) -> Result<Document> {
    // ---
    docs.into_iter()
        .next()
        .ok_or_else(|| GuardError::Control("empty command reply".into()))
}

/// Commands acknowledge with `ok: 1`; anything else carries `errmsg`.
fn command_ok(reply: Document) -> Result<Document> {
    // ---
    match reply.get("ok").and_then(numeric) {
        Some(ok) if ok != 0.0 => Ok(reply),
        _ => {
            let errmsg = reply.get_str("errmsg").unwrap_or("command failed");
            Err(GuardError::Control(errmsg.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
