//! Wire-level plumbing for the queryguard proxy.
//!
//! The classic opcode-framed protocol frames every message with a fixed
//! 16-byte header followed by an opcode-specific body:
//!
//! ```text
//! offset
//!    0  ┐
//!    1  │ messageLength (i32, little-endian)
//!    2  │   total size in bytes, header included
//!    3  ┘
//!    4  ┐
//!    5  │ requestID (i32, little-endian)
//!    6  │
//!    7  ┘
//!    8  ┐
//!    9  │ responseTo (i32, little-endian)
//!   10  │
//!   11  ┘
//!   12  ┐
//!   13  │ opCode (i32, little-endian)
//!   14  │
//!   15  ┘
//! ------
//!    body (messageLength − 16 bytes)
//! ```
//!
//! This crate owns the header and opcode table, the framed read/write and
//! copy helpers, the synthetic error reply builder, and the backoff TCP
//! dialer shared by the proxy pump and the control channel.

mod codec;
mod dial;
mod header;
mod reply;

// --- header
pub use header::{MessageHeader, OpCode, HEADER_LEN, MAX_MESSAGE_LEN};

// --- codec
pub use codec::{
    // ---
    copy_exact,
    copy_message,
    decode_document,
    encode_document,
    read_cstring,
    read_document_raw,
    read_header,
    write_header,
};

// --- reply
pub use reply::{error_reply, REPLY_PRELUDE_LEN};

// --- dial
pub use dial::{dial_upstream, DIAL_ATTEMPTS, INITIAL_RETRY_SLEEP};
