//! Overrun recovery: when relaying a response fails, find the server-side
//! operation still burning cycles, kill it, and hand the client a
//! protocol-shaped error instead of a dead socket.

use std::time::Duration;

use bson::{doc, Bson, Document};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use queryguard_domain::{ControlChannelPtr, GuardError, Namespace, Result};
use queryguard_wire::{error_reply, MessageHeader};

use super::query::flatten_query;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Server code for "operation exceeded time limit".
pub const TIME_LIMIT_CODE: i32 = 50;

/// Server code for a killed cursor/operation.
pub const KILLED_CODE: i32 = 14044;

/// Server code for "no index available for this query".
pub const NO_INDEX_CODE: i32 = 17357;

// ---------------------------------------------------------------------------
// Op filter
// ---------------------------------------------------------------------------

/// The in-progress-operation filter for one failed query.
///
/// With a tracking id the tag pins the exact operation. Without one the
/// filter falls back to a fingerprint: elapsed run time with one second of
/// slack, plus every leaf of the original query as a dotted-path equality
/// constraint under `query.`.
pub fn overrun_filter(
    ns: &Namespace,
    original_query: &Document,
    tracking_id: Option<&str>,
    elapsed: Duration,
) -> Document {
    // ---
    let mut filter = doc! { "op": "query", "ns": ns.full_name() };

    match tracking_id {
        Some(id) => {
            filter.insert("query.$queryGuard.track", id);
        }
        None => {
            filter.insert(
                "secs_running",
                doc! { "$gte": elapsed.as_secs_f64().floor() - 1.0 },
            );
            let mut path = vec!["query".to_string()];
            flatten_query(
                &Bson::Document(original_query.clone()),
                &mut path,
                &mut filter,
            );
        }
    }

    filter
}

// ---------------------------------------------------------------------------
// kill_overrun
// ---------------------------------------------------------------------------

/// Kill whatever the failed query left running and answer the client.
///
/// `error` is the original response-relay failure: a deadline maps to the
/// time-limit reply (code [`TIME_LIMIT_CODE`]), anything else to a killed
/// reply carrying the error text (code [`KILLED_CODE`]). Control-channel
/// failures are logged and swallowed; they must never take the pump down
/// on top of the failure being handled.
///
/// Exactly one synthetic reply is written, under a refreshed client
/// deadline; the returned error only reports that write failing.
#[allow(clippy::too_many_arguments)]
pub async fn kill_overrun<C>(
    control: &ControlChannelPtr,
    client: &mut C,
    request: &MessageHeader,
    ns: &Namespace,
    original_query: &Document,
    tracking_id: Option<&str>,
    elapsed: Duration,
    message_timeout: Duration,
    error: &GuardError,
) -> Result<()>
where
    C: AsyncWrite + Unpin + Send,
{
    // ---
    let filter = overrun_filter(ns, original_query, tracking_id, elapsed);

    match control.find_ops(filter).await {
        Ok(ops) => {
            for opid in ops {
                info!(ns = %ns.full_name(), opid = ?opid, "killing overrun operation");
                if let Err(e) = control.kill_op(opid).await {
                    warn!(ns = %ns.full_name(), error = %e, "kill-op failed");
                }
            }
        }
        Err(e) => {
            warn!(ns = %ns.full_name(), error = %e, "in-progress operation lookup failed");
        }
    }

    let (message, code) = if error.is_timeout() {
        (
            format!(
                "Your query exceeded the time limit of {}s and has been killed",
                message_timeout.as_secs()
            ),
            TIME_LIMIT_CODE,
        )
    } else {
        (
            format!("Error: {error}. Your query has been killed"),
            KILLED_CODE,
        )
    };

    let reply = error_reply(request, &message, code)?;
    match tokio::time::timeout(message_timeout, client.write_all(&reply)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(GuardError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
