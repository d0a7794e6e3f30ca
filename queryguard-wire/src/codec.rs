//! Framed reads, writes, and whole-message copies.
//!
//! Reads return the exact byte sequence consumed so forward-copy paths can
//! re-emit a message verbatim. Documents are validated only to the extent
//! of their length prefix; value tags inside are opaque here.

use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use queryguard_domain::{GuardError, Result};

use super::header::{MessageHeader, HEADER_LEN, MAX_MESSAGE_LEN};

// ---------------------------------------------------------------------------
// Header I/O
// ---------------------------------------------------------------------------

/// Read one message header.
///
/// Returns `Ok(None)` on clean end-of-stream (the peer closed between
/// messages). A close mid-header is a framing error, as is a length field
/// outside `16..=`[`MAX_MESSAGE_LEN`].
pub async fn read_header<R>(stream: &mut R) -> Result<Option<MessageHeader>>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut buf = [0u8; HEADER_LEN];

    // Probe the first byte to distinguish clean EOF from a torn header.
    match stream.read(&mut buf[..1]).await {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) => return Err(e.into()),
    }

    stream
        .read_exact(&mut buf[1..])
        .await
        .map_err(|e| GuardError::Framing(format!("short header read: {e}")))?;

    MessageHeader::from_wire(&buf).map(Some)
}

// ---

/// Write the 16 header bytes.
pub async fn write_header<W>(stream: &mut W, header: &MessageHeader) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // ---
    stream.write_all(&header.to_wire()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// C-strings and documents
// ---------------------------------------------------------------------------

/// Read a null-terminated string, returning the bytes *including* the
/// terminator so forward paths can re-emit them unchanged.
///
/// Bounded at [`MAX_MESSAGE_LEN`]; a stream that long without a NUL is
/// desynchronized.
pub async fn read_cstring<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut out = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        stream
            .read_exact(&mut byte)
            .await
            .map_err(|e| GuardError::Framing(format!("short cstring read: {e}")))?;
        out.push(byte[0]);

        if byte[0] == 0 {
            return Ok(out);
        }
        if out.len() >= MAX_MESSAGE_LEN as usize {
            return Err(GuardError::Framing("unterminated cstring".into()));
        }
    }
}

// ---

/// Read one length-prefixed document, returning the raw bytes including
/// the 4-byte prefix. The prefix must cover itself plus the trailing NUL
/// (≥ 5) and stay under [`MAX_MESSAGE_LEN`]; the check runs before the
/// body allocation.
pub async fn read_document_raw<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut prefix = [0u8; 4];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| GuardError::Framing(format!("short document length read: {e}")))?;

    let len = i32::from_le_bytes(prefix);
    if len < 5 || len > MAX_MESSAGE_LEN {
        return Err(GuardError::Framing(format!(
            "document length {len} out of range"
        )));
    }

    let mut raw = vec![0u8; len as usize];
    raw[0..4].copy_from_slice(&prefix);
    stream
        .read_exact(&mut raw[4..])
        .await
        .map_err(|e| GuardError::Framing(format!("short document read: {e}")))?;

    Ok(raw)
}

// ---

/// Parse raw document bytes into the ordered in-memory form.
pub fn decode_document(raw: &[u8]) -> Result<Document> {
    // ---
    Ok(Document::from_reader(raw)?)
}

/// Serialize a document back to wire bytes (length prefix included).
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    // ---
    let mut out = Vec::new();
    doc.to_writer(&mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Whole-message copies
// ---------------------------------------------------------------------------

/// Stream exactly `n` bytes from `src` to `dst`.
pub async fn copy_exact<R, W>(src: &mut R, dst: &mut W, n: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // ---
    let copied = tokio::io::copy(&mut src.take(n), dst).await?;
    if copied != n {
        return Err(GuardError::Framing(format!(
            "stream ended after {copied} of {n} body bytes"
        )));
    }
    Ok(())
}

// ---

/// Copy exactly one full message (header + body) from `src` to `dst` and
/// return its header. End-of-stream where a message is due is an error.
pub async fn copy_message<R, W>(src: &mut R, dst: &mut W) -> Result<MessageHeader>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // ---
    let header = read_header(src)
        .await?
        .ok_or_else(|| GuardError::Framing("stream closed while a message was expected".into()))?;

    write_header(dst, &header).await?;
    copy_exact(src, dst, header.body_len()).await?;

    Ok(header)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
