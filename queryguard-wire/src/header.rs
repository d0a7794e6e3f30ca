use queryguard_domain::{GuardError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Fixed message header size: messageLength(4) + requestID(4) +
/// responseTo(4) + opCode(4).
pub const HEADER_LEN: usize = 16;

/// Sanity cap on `messageLength` and document length prefixes.
///
/// The server's own document limit is far below this; anything larger is a
/// desynchronized stream or a hostile peer, and rejecting before allocation
/// keeps a bad length from pinning the heap.
pub const MAX_MESSAGE_LEN: i32 = 48 * 1024 * 1024; // 48 MiB

// ---------------------------------------------------------------------------
// OpCode
// ---------------------------------------------------------------------------

/// Message kind tag from the header.
///
/// Unknown values are preserved in [`OpCode::Other`] so traffic from newer
/// clients still forwards byte-for-byte instead of failing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    // ---
    Reply,
    /// The deprecated generic message opcode (1000).
    Msg,
    Update,
    Insert,
    /// Reserved slot between Insert and Query (2003).
    GetByOid,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Other(i32),
}

// ---

impl OpCode {
    // ---

    pub fn from_i32(value: i32) -> OpCode {
        // ---
        match value {
            1 => OpCode::Reply,
            1000 => OpCode::Msg,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2003 => OpCode::GetByOid,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            other => OpCode::Other(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        // ---
        match self {
            OpCode::Reply => 1,
            OpCode::Msg => 1000,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::GetByOid => 2003,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Other(v) => v,
        }
    }

    /// Whether the server answers this opcode with exactly one reply
    /// message the proxy must relay back.
    pub fn has_response(self) -> bool {
        // ---
        matches!(self, OpCode::Query | OpCode::GetMore)
    }
}

// ---------------------------------------------------------------------------
// MessageHeader
// ---------------------------------------------------------------------------

/// The fixed 16-byte message header. All fields little-endian i32 on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    // ---
    /// Total message size in bytes, this header included.
    pub message_length: i32,

    pub request_id: i32,

    /// `request_id` of the message this one answers; 0 on requests.
    pub response_to: i32,

    pub op_code: OpCode,
}

// ---

impl MessageHeader {
    // ---

    pub fn to_wire(&self) -> [u8; HEADER_LEN] {
        // ---
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_code.as_i32().to_le_bytes());
        buf
    }

    /// Decode and validate a header. `message_length` must cover at least
    /// the header itself and stay under [`MAX_MESSAGE_LEN`].
    pub fn from_wire(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        // ---
        let message_length = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        if message_length < HEADER_LEN as i32 || message_length > MAX_MESSAGE_LEN {
            return Err(GuardError::Framing(format!(
                "message length {message_length} out of range"
            )));
        }

        Ok(Self {
            message_length,
            request_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            response_to: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            op_code: OpCode::from_i32(i32::from_le_bytes(buf[12..16].try_into().unwrap())),
        })
    }

    /// Body size in bytes (everything after the header).
    pub fn body_len(&self) -> u64 {
        // ---
        (self.message_length as u64).saturating_sub(HEADER_LEN as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
