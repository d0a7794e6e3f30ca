//! Accept loop: one independent pump task per client connection.
//!
//! The listener shares nothing with the pumps beyond the immutable
//! [`Pump`] state; a panic or failure in one connection task never
//! touches another, and an accept error is logged and survived.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use super::pump::Pump;

// ---

pub async fn run(listener: TcpListener, pump: Arc<Pump>) {
    // ---
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!(remote = %addr, "accepted client connection");
                tokio::spawn(pump.clone().run(socket));
            }
            Err(e) => {
                warn!(error = %e, "client accept error");
            }
        }
    }
}
