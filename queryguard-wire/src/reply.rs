//! Synthetic error replies.
//!
//! The only message the proxy ever originates toward a client: a
//! `Reply`-opcode message answering one request, carrying a single
//! `{ $err, code }` document.
//!
//! Reply body layout:
//!
//! ```text
//! offset
//!    0   responseFlags  (i32) = 0
//!    4   cursorID       (i64) = 0
//!   12   startingFrom   (i32) = 0
//!   16   numberReturned (i32) = 1
//! ------
//!   20   document { "$err": <string>, "code": <i32> }
//! ```

use bson::doc;

use queryguard_domain::Result;

use super::codec::encode_document;
use super::header::{MessageHeader, OpCode, HEADER_LEN};

// ---

/// Fixed reply prelude size: responseFlags(4) + cursorID(8) +
/// startingFrom(4) + numberReturned(4).
pub const REPLY_PRELUDE_LEN: usize = 20;

// ---

/// Build one complete synthetic error reply answering `request`.
///
/// Both `responseTo` and `requestID` take the offending request's id so
/// the client pairs the reply with its query.
pub fn error_reply(request: &MessageHeader, message: &str, code: i32) -> Result<Vec<u8>> {
    // ---
    let error_doc = encode_document(&doc! {
        "$err": message,
        "code": code,
    })?;

    let header = MessageHeader {
        message_length: (HEADER_LEN + REPLY_PRELUDE_LEN + error_doc.len()) as i32,
        request_id: request.request_id,
        response_to: request.request_id,
        op_code: OpCode::Reply,
    };

    let mut out = Vec::with_capacity(header.message_length as usize);
    out.extend_from_slice(&header.to_wire());
    out.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
    out.extend_from_slice(&0i64.to_le_bytes()); // cursorID
    out.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    out.extend_from_slice(&1i32.to_le_bytes()); // numberReturned
    out.extend_from_slice(&error_doc);

    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::super::codec::decode_document;
    use super::*;

    // ---

    #[test]
    fn reply_layout_is_pinned() {
        // ---
        let request = MessageHeader {
            message_length: 64,
            request_id: 1234,
            response_to: 0,
            op_code: OpCode::Query,
        };

        let wire = error_reply(&request, "no index", 17357).unwrap();

        let header = MessageHeader::from_wire(&wire[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.message_length as usize, wire.len());
        assert_eq!(header.request_id, 1234);
        assert_eq!(header.response_to, 1234);
        assert_eq!(header.op_code, OpCode::Reply);

        // Prelude: all zero except numberReturned = 1 at offset 16.
        assert_eq!(&wire[HEADER_LEN..HEADER_LEN + 16], &[0u8; 16]);
        assert_eq!(
            &wire[HEADER_LEN + 16..HEADER_LEN + REPLY_PRELUDE_LEN],
            &1i32.to_le_bytes()
        );

        let body = decode_document(&wire[HEADER_LEN + REPLY_PRELUDE_LEN..]).unwrap();
        assert_eq!(body.get_str("$err").unwrap(), "no index");
        assert_eq!(body.get_i32("code").unwrap(), 17357);
    }
}
