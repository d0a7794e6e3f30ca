//! Queryguard daemon.
//!
//! A transparent 1:1 proxy that sits in front of a document-database
//! cluster, rejects queries no index can serve, and kills queries that
//! overrun their time budget.
//!
//! Usage:
//!   queryguard --servers db1:27017,db2:27017 [--listen 127.0.0.1:27016]

use std::sync::Arc;

// ---

use clap::Parser;
use tracing::info;

// ---

use queryguard_control::ClusterControl;
use queryguard_domain::ControlChannelPtr;
use queryguard_proxy::{config::Config, listener, pump::Pump};

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();
    cfg.validate()?;

    let no_color = std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.listen,
        upstreams = cfg.servers.len(),
        "queryguard starting",
    );

    // The control channel comes up before any client traffic is accepted;
    // without it there is no admission and no kill path.
    let control = ClusterControl::connect(
        cfg.servers.clone(),
        cfg.username.clone(),
        cfg.password.clone(),
        cfg.auth_db.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("control channel dial failed: {e}"))?;
    let control: ControlChannelPtr = Arc::new(control);
    info!("control channel established");

    let pump = Arc::new(Pump::new(
        control,
        cfg.servers.clone(),
        cfg.message_timeout(),
        cfg.client_idle_timeout(),
    ));

    let listener = tokio::net::TcpListener::bind(&cfg.listen)
        .await
        .map_err(|e| anyhow::anyhow!("listen on {} failed: {e}", cfg.listen))?;
    info!(listen = %cfg.listen, "accepting client connections");

    tokio::select! {
        _ = listener::run(listener, pump) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
