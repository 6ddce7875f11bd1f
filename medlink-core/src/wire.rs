//! Framing: 4-byte LE length prefix + bincode `{version, chunk}`. A link is a byte stream;
//! frames are cut into writes no larger than the link MTU and rebuilt by [`FrameBuffer`].

use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::protocol::PROTOCOL_VERSION;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Largest write a minimal-MTU BLE link carries (ATT MTU 23 minus the 3-byte ATT header).
pub const DEFAULT_WRITE_SIZE: usize = 20;

#[derive(Serialize, Deserialize)]
struct Frame {
    version: u8,
    chunk: Chunk,
}

/// Encode a chunk into a single frame.
pub fn encode_frame(chunk: &Chunk) -> Result<Vec<u8>, FrameEncodeError> {
    let frame = Frame {
        version: PROTOCOL_VERSION,
        chunk: chunk.clone(),
    };
    let payload = bincode::serialize(&frame).map_err(FrameEncodeError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a chunk into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the chunk and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Chunk, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame: Frame =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    if frame.version != PROTOCOL_VERSION {
        return Err(FrameDecodeError::Version(frame.version));
    }
    Ok((frame.chunk, LEN_SIZE + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Per-peer receive buffer. Radio writes arrive in order but a frame may span several.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, `Ok(None)` until one is buffered. A malformed frame discards
    /// everything buffered, since the stream cannot be resynchronised.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, FrameDecodeError> {
        match decode_frame(&self.buf) {
            Ok((chunk, used)) => {
                self.buf.drain(..used);
                Ok(Some(chunk))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
