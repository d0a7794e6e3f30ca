//! Upstream TCP dialing with bounded retries and exponential backoff.

use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tracing::warn;

use queryguard_domain::{GuardError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Connection attempts before giving up.
pub const DIAL_ATTEMPTS: u32 = 7;

/// Backoff sleep before the second attempt; doubles after each failure.
pub const INITIAL_RETRY_SLEEP: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Endpoint pick
// ---------------------------------------------------------------------------

/// Pick the endpoint for one attempt.
///
/// A single endpoint is used as-is. With more than one, the pick is
/// uniform over the first N−1: the last endpoint is never chosen. Kept
/// that way pending a product decision, see DESIGN.md.
fn pick_endpoint(servers: &[String]) -> &str {
    // ---
    if servers.len() == 1 {
        return &servers[0];
    }
    let i = rand::thread_rng().gen_range(0..servers.len() - 1);
    &servers[i]
}

// ---------------------------------------------------------------------------
// dial_upstream
// ---------------------------------------------------------------------------

/// Open a TCP connection to one of `servers`.
///
/// Up to [`DIAL_ATTEMPTS`] tries, a fresh endpoint pick each time, with
/// exponential backoff between failures. On exhaustion the error names the
/// last endpoint tried. `TCP_NODELAY` is set on success.
pub async fn dial_upstream(servers: &[String]) -> Result<TcpStream> {
    // ---
    debug_assert!(!servers.is_empty());

    let mut retry_sleep = INITIAL_RETRY_SLEEP;
    let mut last_endpoint = String::new();

    for _ in 0..DIAL_ATTEMPTS {
        let endpoint = pick_endpoint(servers);
        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                warn!(
                    endpoint,
                    error = %e,
                    retry_ms = retry_sleep.as_millis() as u64,
                    "unable to connect to upstream, retrying"
                );
            }
        }

        tokio::time::sleep(retry_sleep).await;
        retry_sleep *= 2;
        last_endpoint = endpoint.to_string();
    }

    Err(GuardError::Dial {
        endpoint: last_endpoint,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // ---

    #[test]
    fn single_endpoint_always_picked() {
        // ---
        let servers = vec!["127.0.0.1:27017".to_string()];
        for _ in 0..16 {
            assert_eq!(pick_endpoint(&servers), "127.0.0.1:27017");
        }
    }

    // ---

    /// With N > 1 endpoints the last one is never selected.
    #[test]
    fn last_endpoint_never_picked() {
        // ---
        let servers = vec![
            "a:27017".to_string(),
            "b:27017".to_string(),
            "c:27017".to_string(),
        ];

        for _ in 0..512 {
            assert_ne!(pick_endpoint(&servers), "c:27017");
        }
    }

    // ---

    #[tokio::test]
    async fn dial_reaches_live_listener() {
        // ---
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stream = dial_upstream(&[addr]).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    // ---

    /// Exhaustion names the endpoint that failed last.
    #[tokio::test(start_paused = true)]
    async fn dial_exhaustion_names_last_endpoint() {
        // ---
        // Bind-then-drop to get a port nothing is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial_upstream(&[addr.clone()]).await.unwrap_err();
        match err {
            GuardError::Dial { endpoint } => assert_eq!(endpoint, addr),
            other => panic!("expected dial error, got {other}"),
        }
    }
}
