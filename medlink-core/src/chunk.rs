//! Message codec: split payloads into link-sized chunks, buffer per (peer, message), reassemble.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::Message;

/// Default chunk payload size in bytes (minimal BLE ATT MTU).
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Incomplete buffers idle this long are discarded.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

/// One on-air fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub message_id: [u8; 16],
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("payload needs more than u32::MAX chunks")]
    TooManyChunks,
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk says {actual} total chunks, buffer expects {expected}")]
    TotalMismatch { expected: u32, actual: u32 },
    #[error("reassembled bytes are not a message envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// Split `payload` into `ceil(len / chunk_size)` chunks sharing `message_id`.
/// Every chunk but the last is exactly `chunk_size` bytes. Size 0 means the default.
pub fn split_into_chunks(
    message_id: [u8; 16],
    payload: &[u8],
    chunk_size: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let total =
        u32::try_from(payload.len().div_ceil(size)).map_err(|_| ChunkError::TooManyChunks)?;
    Ok(payload
        .chunks(size)
        .zip(0u32..)
        .map(|(bytes, chunk_index)| Chunk {
            message_id,
            chunk_index,
            total_chunks: total,
            bytes: bytes.to_vec(),
        })
        .collect())
}

/// Split with a fresh random message id.
pub fn chunk(payload: &[u8], max_chunk_size: usize) -> Result<Vec<Chunk>, ChunkError> {
    split_into_chunks(uuid::Uuid::new_v4().into_bytes(), payload, max_chunk_size)
}

/// Outcome of feeding one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly<T> {
    Complete(T),
    Incomplete,
}

/// Chunks received so far for one (peer, message).
struct ReassemblyBuffer {
    total_chunks: u32,
    received: BTreeMap<u32, Vec<u8>>,
    last_chunk_at: Instant,
}

impl ReassemblyBuffer {
    fn new(total_chunks: u32, now: Instant) -> Self {
        Self {
            total_chunks,
            received: BTreeMap::new(),
            last_chunk_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }

    fn into_bytes(self) -> Vec<u8> {
        self.received.into_values().flatten().collect()
    }
}

/// Reassembly state for all peers.
pub struct MessageCodec {
    buffers: HashMap<(String, [u8; 16]), ReassemblyBuffer>,
    timeout: Duration,
}

impl MessageCodec {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout,
        }
    }

    /// Serialize a message and split it for the link.
    pub fn encode(message: &Message, max_chunk_size: usize) -> Result<Vec<Chunk>, ChunkError> {
        let bytes = message.to_bytes()?;
        let id = uuid::Uuid::parse_str(&message.id)
            .map(|u| u.into_bytes())
            .unwrap_or_else(|_| uuid::Uuid::new_v4().into_bytes());
        split_into_chunks(id, &bytes, max_chunk_size)
    }

    /// Buffer a chunk; return the payload once every index `0..total` is present.
    pub fn receive_bytes(
        &mut self,
        peer: &str,
        chunk: Chunk,
        now: Instant,
    ) -> Result<Reassembly<Vec<u8>>, ChunkError> {
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(ChunkError::IndexOutOfRange {
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }
        let key = (peer.to_string(), chunk.message_id);
        let stale = self
            .buffers
            .get(&key)
            .is_some_and(|b| now.saturating_duration_since(b.last_chunk_at) >= self.timeout);
        if stale {
            self.buffers.remove(&key);
            tracing::warn!(
                device_id = peer,
                message_id = %uuid::Uuid::from_bytes(chunk.message_id),
                "reassembly timed out; starting fresh buffer"
            );
        }
        let buffer = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| ReassemblyBuffer::new(chunk.total_chunks, now));
        if buffer.total_chunks != chunk.total_chunks {
            return Err(ChunkError::TotalMismatch {
                expected: buffer.total_chunks,
                actual: chunk.total_chunks,
            });
        }
        buffer.received.insert(chunk.chunk_index, chunk.bytes);
        buffer.last_chunk_at = now;
        if !buffer.is_complete() {
            return Ok(Reassembly::Incomplete);
        }
        match self.buffers.remove(&key) {
            Some(done) => Ok(Reassembly::Complete(done.into_bytes())),
            None => Ok(Reassembly::Incomplete),
        }
    }

    /// Like [`receive_bytes`](Self::receive_bytes), parsing the result as a [`Message`].
    pub fn receive(
        &mut self,
        peer: &str,
        chunk: Chunk,
        now: Instant,
    ) -> Result<Reassembly<Message>, ChunkError> {
        match self.receive_bytes(peer, chunk, now)? {
            Reassembly::Complete(bytes) => Ok(Reassembly::Complete(Message::from_bytes(&bytes)?)),
            Reassembly::Incomplete => Ok(Reassembly::Incomplete),
        }
    }

    /// Drop buffers idle past the timeout. Returns how many were evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.buffers.len();
        self.buffers.retain(|(peer, id), b| {
            let keep = now.saturating_duration_since(b.last_chunk_at) < timeout;
            if !keep {
                tracing::warn!(
                    device_id = %peer,
                    message_id = %uuid::Uuid::from_bytes(*id),
                    have = b.received.len(),
                    total = b.total_chunks,
                    "chunk timeout; discarding partial message"
                );
            }
            keep
        });
        before - self.buffers.len()
    }

    /// Forget everything buffered for a peer (on disconnect).
    pub fn drop_peer(&mut self, peer: &str) {
        self.buffers.retain(|(p, _), _| p != peer);
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}
