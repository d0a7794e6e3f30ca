//! CLI configuration for the `queryguard` daemon.
//!
//! Run shape:
//!   queryguard --servers db1:27017,db2:27017 [--listen 127.0.0.1:27016]
//!              [--username u --password p [--auth-db admin]]
//!              [--message-timeout-secs 60] [--client-idle-timeout-secs 600]

use std::time::Duration;

use clap::Parser;

// ---------------------------------------------------------------------------
// Defaults — named constants so tests can assert against them.
// ---------------------------------------------------------------------------

/// Default client-facing bind address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:27016";

/// Default ceiling on each in-flight message's total duration.
///
/// Admitted queries are sent upstream with a server-side time cap of one
/// second less, so the server gives up before the proxy's own deadline
/// fires in the common case.
pub const DEFAULT_MESSAGE_TIMEOUT_SECS: u64 = 60;

/// Default wait for the next request on an idle client connection.
pub const DEFAULT_CLIENT_IDLE_TIMEOUT_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "queryguard", about = "Index-admission proxy for a document database")]
pub struct Config {
    // ---
    /// TCP address to accept client connections on.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Comma-separated upstream endpoints (`host:port,host:port,...`).
    /// Client traffic and the control channel both dial from this list.
    #[arg(long, value_delimiter = ',', required = true)]
    pub servers: Vec<String>,

    /// Username for the control-channel session.
    #[arg(long)]
    pub username: Option<String>,

    /// Password for the control-channel session.
    #[arg(long)]
    pub password: Option<String>,

    /// Database the control-channel credentials authenticate against.
    #[arg(long, default_value = "admin")]
    pub auth_db: String,

    /// Ceiling on each in-flight message's total duration, in seconds.
    ///
    /// Set as a deadline on both sockets for every relayed message, and
    /// the source of the server-side query time cap (one second less).
    #[arg(long, default_value_t = DEFAULT_MESSAGE_TIMEOUT_SECS)]
    pub message_timeout_secs: u64,

    /// How long to wait for the next request on an idle client, in
    /// seconds, before closing the connection.
    #[arg(long, default_value_t = DEFAULT_CLIENT_IDLE_TIMEOUT_SECS)]
    pub client_idle_timeout_secs: u64,
}

// ---

impl Config {
    // ---

    /// Validate config fields that clap cannot express as type constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        // ---
        if self.servers.is_empty() {
            anyhow::bail!("--servers requires at least one host:port endpoint");
        }
        if self.servers.iter().any(|s| s.trim().is_empty()) {
            anyhow::bail!("--servers contains an empty endpoint");
        }
        if self.message_timeout_secs < 2 {
            anyhow::bail!(
                "--message-timeout-secs must be at least 2 (the query time cap is one second less), got {}",
                self.message_timeout_secs
            );
        }
        if self.client_idle_timeout_secs == 0 {
            anyhow::bail!("--client-idle-timeout-secs must be > 0");
        }
        if self.username.is_some() != self.password.is_some() {
            anyhow::bail!("--username and --password must be given together");
        }
        Ok(())
    }

    pub fn message_timeout(&self) -> Duration {
        // ---
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        // ---
        Duration::from_secs(self.client_idle_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
