//! Legacy nonce/digest authentication material.
//!
//! The handshake is two commands against the auth database: `getnonce`
//! returns a server nonce, then `authenticate` presents
//! `key = md5hex(nonce + user + md5hex(user + ":mongo:" + password))`.

use md5::{Digest, Md5};

// ---

fn md5_hex(parts: &[&str]) -> String {
    // ---
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---

/// The stored-password form: `md5hex(user + ":mongo:" + password)`.
pub(crate) fn password_digest(user: &str, password: &str) -> String {
    // ---
    md5_hex(&[user, ":mongo:", password])
}

/// The per-session proof: `md5hex(nonce + user + digest)`.
pub(crate) fn auth_key(nonce: &str, user: &str, digest: &str) -> String {
    // ---
    md5_hex(&[nonce, user, digest])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
