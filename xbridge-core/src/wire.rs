//! Framing: length-prefix (4 bytes LE) + bincode envelope.

use crate::protocol::Envelope;

pub(crate) const LEN_SIZE: usize = 4;

/// Default upper bound for a single frame.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_envelope(envelope)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode the envelope body without a length prefix.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    Ok(bincode::serialize(envelope)?)
}

/// Decode a complete envelope body (no length prefix).
///
/// Truncated input and unknown kinds both fail with [`FrameDecodeError::Malformed`].
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, FrameDecodeError> {
    bincode::deserialize(bytes).map_err(FrameDecodeError::Malformed)
}

/// Error encoding an envelope into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let Some(len) = frame_len(bytes)? else {
        return Err(FrameDecodeError::NeedMore);
    };
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let envelope = decode_envelope(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((envelope, LEN_SIZE + len))
}

/// Read the length prefix, if present, and check it against the frame limit.
pub(crate) fn frame_len(bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(Some(len as usize))
}

/// Error decoding a frame (need more bytes, too large, or malformed envelope).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("malformed envelope: {0}")]
    Malformed(#[source] bincode::Error),
}
