//! The per-connection relay state machine.
//!
//! One [`Pump`] task owns one client socket and one upstream socket. The
//! loop reads a header under the client idle deadline, then handles the
//! message under a fresh per-message deadline on both sockets:
//!
//! - non-query opcodes stream through byte-for-byte, plus one full
//!   response message in the reverse direction when the opcode has one;
//! - queries are parsed, checked against the target collection's indexes,
//!   and either rejected with a synthetic reply, forwarded verbatim
//!   (command/system/metadata namespaces and empty predicates), or
//!   mutated (wrapped, time-capped, tagged) before forwarding;
//! - a failed response relay hands off to the kill path.
//!
//! Failures split two ways, per [`Recovery`]: torn client framing ends the
//! connection, while any upstream trouble replaces only the upstream
//! socket, since the old one may still be mid-reply and nothing downstream
//! of a torn frame can be trusted.
//!
//! Within one connection, messages are strictly serialized: a new client
//! header is not read until the previous message's response has been
//! relayed or a synthetic reply written.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use queryguard_domain::{ControlChannelPtr, GuardError, Namespace, Result};
use queryguard_wire::{
    // ---
    copy_exact,
    copy_message,
    decode_document,
    dial_upstream,
    encode_document,
    error_reply,
    read_cstring,
    read_document_raw,
    read_header,
    write_header,
    MessageHeader,
    OpCode,
    HEADER_LEN,
};

use super::killop::{kill_overrun, NO_INDEX_CODE};
use super::query::{check_for_index, mutate_query, new_tracking_id};

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// How the pump proceeds after a message-handling failure.
#[derive(Debug)]
pub enum Recovery {
    // ---
    /// The client stream is unusable (torn framing, failed reject write).
    /// Close the connection.
    CloseClient(GuardError),

    /// The upstream may be mid-message; replace it and keep serving this
    /// client.
    ReconnectUpstream(GuardError),
}

// ---

impl Recovery {
    fn error(&self) -> &GuardError {
        // ---
        match self {
            Recovery::CloseClient(e) | Recovery::ReconnectUpstream(e) => e,
        }
    }
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

/// Shared, read-only state behind every client connection task.
pub struct Pump {
    // ---
    control: ControlChannelPtr,
    servers: Vec<String>,
    message_timeout: Duration,
    client_idle_timeout: Duration,
}

// ---

impl Pump {
    // ---

    pub fn new(
        control: ControlChannelPtr,
        servers: Vec<String>,
        message_timeout: Duration,
        client_idle_timeout: Duration,
    ) -> Self {
        // ---
        Self {
            control,
            servers,
            message_timeout,
            client_idle_timeout,
        }
    }

    /// Server-side query time cap: one second under the message deadline,
    /// in milliseconds.
    fn max_time_cap_ms(&self) -> f64 {
        // ---
        (self.message_timeout.saturating_sub(Duration::from_secs(1))).as_millis() as f64
    }

    // ---

    /// Relay one client connection until it closes, idles out, or fails.
    pub async fn run(self: Arc<Self>, mut client: TcpStream) {
        // ---
        let remote = client
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let mut server = match dial_upstream(&self.servers).await {
            Ok(s) => s,
            Err(e) => {
                warn!(remote = %remote, error = %e, "upstream dial failed, dropping client");
                return;
            }
        };
        if let Err(e) = client.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "could not set nodelay on client socket");
        }

        loop {
            let header = match tokio::time::timeout(
                self.client_idle_timeout,
                read_header(&mut client),
            )
            .await
            {
                Ok(Ok(Some(header))) => header,
                Ok(Ok(None)) => {
                    debug!(remote = %remote, "client closed connection");
                    return;
                }
                Ok(Err(e)) => {
                    warn!(remote = %remote, error = %e, "client header read failed");
                    return;
                }
                Err(_) => {
                    info!(remote = %remote, "client idle timeout");
                    return;
                }
            };

            match self
                .handle_message(header, &mut client, &mut server, &remote)
                .await
            {
                Ok(()) => {}
                Err(Recovery::CloseClient(e)) => {
                    warn!(remote = %remote, error = %e, "client connection unusable, closing");
                    return;
                }
                Err(recovery) => {
                    warn!(
                        remote = %remote,
                        error = %recovery.error(),
                        "message relay failed, reconnecting upstream"
                    );
                    server = match dial_upstream(&self.servers).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(remote = %remote, error = %e, "upstream redial failed, dropping client");
                            return;
                        }
                    };
                }
            }
        }
    }

    // ---

    /// Handle one message under a fresh per-message deadline.
    ///
    /// Generic over the endpoints so tests drive it with in-memory pipes.
    pub async fn handle_message<C, S>(
        &self,
        header: MessageHeader,
        client: &mut C,
        server: &mut S,
        remote: &str,
    ) -> std::result::Result<(), Recovery>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // ---
        let deadline = Instant::now() + self.message_timeout;

        if header.op_code == OpCode::Query {
            return self
                .handle_query(header, client, server, remote, deadline)
                .await;
        }

        with_deadline(deadline, async {
            write_header(server, &header).await?;
            copy_exact(client, server, header.body_len()).await?;
            if header.op_code.has_response() {
                copy_message(server, client).await?;
            }
            Ok(())
        })
        .await
        .map_err(Recovery::ReconnectUpstream)
    }

    // ---

    /// The query path: parse, bypass or admit, mutate, forward, relay the
    /// response, and on response failure engage the kill path.
    async fn handle_query<C, S>(
        &self,
        mut header: MessageHeader,
        client: &mut C,
        server: &mut S,
        remote: &str,
        deadline: Instant,
    ) -> std::result::Result<(), Recovery>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // ---
        let parsed = with_deadline(deadline, async {
            let mut flags = [0u8; 4];
            client.read_exact(&mut flags).await?;
            let ns_bytes = read_cstring(client).await?;
            let mut skip_return = [0u8; 8];
            client.read_exact(&mut skip_return).await?;
            let query_raw = read_document_raw(client).await?;
            Ok((flags, ns_bytes, skip_return, query_raw))
        })
        .await;
        let (flags, ns_bytes, skip_return, query_raw) =
            parsed.map_err(Recovery::CloseClient)?;

        let consumed = HEADER_LEN + 4 + ns_bytes.len() + 8 + query_raw.len();
        let Some(tail) = (header.message_length as u64).checked_sub(consumed as u64) else {
            return Err(Recovery::CloseClient(GuardError::Framing(format!(
                "query fields overrun the declared message length ({} > {})",
                consumed, header.message_length
            ))));
        };

        let query_doc = decode_document(&query_raw).map_err(Recovery::CloseClient)?;
        let namespace = std::str::from_utf8(&ns_bytes[..ns_bytes.len() - 1])
            .ok()
            .and_then(Namespace::parse);

        let ns = match namespace {
            Some(ns) if !ns.bypasses_admission() && !query_doc.is_empty() => ns,
            _ => {
                // Command, metadata, and system traffic (and anything
                // unclassifiable) passes through byte-identically.
                return with_deadline(deadline, async {
                    write_header(server, &header).await?;
                    server.write_all(&flags).await?;
                    server.write_all(&ns_bytes).await?;
                    server.write_all(&skip_return).await?;
                    server.write_all(&query_raw).await?;
                    copy_exact(client, server, tail).await?;
                    copy_message(server, client).await?;
                    Ok(())
                })
                .await
                .map_err(Recovery::ReconnectUpstream);
            }
        };

        debug!(remote = %remote, ns = %ns.full_name(), query = ?query_doc, "checking query");

        if !check_for_index(&self.control, &ns, &query_doc).await {
            info!(remote = %remote, ns = %ns.full_name(), "rejecting query with no usable index");
            return with_deadline(deadline, async {
                // Nothing of this message goes upstream; drain what we
                // haven't read so the next header starts on a boundary.
                copy_exact(client, &mut tokio::io::sink(), tail).await?;
                let reply = error_reply(
                    &header,
                    &format!(
                        "No index was found that could be used for your query try db.{}.getIndexes()",
                        ns.collection()
                    ),
                    NO_INDEX_CODE,
                )?;
                client.write_all(&reply).await?;
                Ok(())
            })
            .await
            .map_err(Recovery::CloseClient);
        }

        // Tag the admitted query so the kill path can find it later.
        let tracking_id = new_tracking_id();
        let mutated = mutate_query(
            query_doc.clone(),
            remote,
            &tracking_id,
            self.max_time_cap_ms(),
        );
        let new_raw = encode_document(&mutated).map_err(Recovery::ReconnectUpstream)?;
        header.message_length =
            header.message_length - query_raw.len() as i32 + new_raw.len() as i32;

        with_deadline(deadline, async {
            write_header(server, &header).await?;
            server.write_all(&flags).await?;
            server.write_all(&ns_bytes).await?;
            server.write_all(&skip_return).await?;
            server.write_all(&new_raw).await?;
            copy_exact(client, server, tail).await?;
            Ok(())
        })
        .await
        .map_err(Recovery::ReconnectUpstream)?;

        let started = Instant::now();
        match with_deadline(deadline, copy_message(server, client)).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let elapsed = started.elapsed();
                warn!(
                    remote = %remote,
                    ns = %ns.full_name(),
                    error = %err,
                    elapsed_secs = elapsed.as_secs(),
                    "response relay failed, engaging kill path"
                );
                if let Err(e) = kill_overrun(
                    &self.control,
                    client,
                    &header,
                    &ns,
                    &query_doc,
                    Some(&tracking_id),
                    elapsed,
                    self.message_timeout,
                    &err,
                )
                .await
                {
                    warn!(remote = %remote, error = %e, "synthetic error delivery failed");
                }
                Err(Recovery::ReconnectUpstream(err))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// with_deadline
// ---------------------------------------------------------------------------

/// Run an I/O future under an absolute deadline, mapping expiry to
/// [`GuardError::Timeout`].
async fn with_deadline<T, F>(deadline: Instant, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    // ---
    match tokio::time::timeout_at(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(GuardError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
