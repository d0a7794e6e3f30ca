//! Control-channel client for the queryguard proxy.
//!
//! [`ClusterControl`] implements the `ControlChannel` trait over the same
//! classic wire protocol the proxy relays: one-shot `Query` messages
//! against command namespaces. It is the proxy's only side channel to the
//! cluster: index listings and document counts for admission, and the
//! in-progress operation list plus kill-op for the overrun path.
//!
//! Connections are pooled and checked out per call, so concurrent callers
//! never serialize on one session. Credentials, when configured, are
//! presented on every fresh connection with the legacy nonce/digest
//! handshake.

mod auth;
mod client;

// --- client
pub use client::ClusterControl;
