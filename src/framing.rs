//! Visual frame fragmentation and reassembly.
//!
//! A block's wire form (header ‖ ciphertext) rarely fits one QR frame, so
//! it is split into chunk frames carrying base64 payload slices. The
//! receiver reassembles by (blockId, chunkIndex); a block is delivered
//! visually only once every chunk index is present. Single-frame blocks use
//! `chunkCount = 1`.

use crate::block::BlockHeader;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Serialized-envelope headroom per chunk frame: JSON keys, two UUIDs, the
/// 64-char checksum, and the numeric fields. Subtracted from the frame
/// budget before base64 sizing.
const FRAME_ENVELOPE_OVERHEAD: usize = 320;

/// One visual frame's worth of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    pub file_id: Uuid,
    pub block_id: Uuid,
    /// Sequence index of the block this slice belongs to.
    pub seq: u64,
    pub chunk_index: u32,
    pub chunk_count: u32,
    /// Decoded length of this slice in bytes.
    pub chunk_size: u32,
    /// The block's header checksum, repeated on every slice so a scanner
    /// can associate frames without having parsed the header yet.
    pub checksum: String,
    /// Base64 (URL-safe, no padding) payload slice.
    pub payload: String,
}

/// Split a block's wire bytes into chunk frames, each fitting within
/// `frame_budget` once serialized.
pub fn split_block(header: &BlockHeader, wire: &[u8], frame_budget: usize) -> Vec<ChunkFrame> {
    let slice_len = max_slice_len(frame_budget);
    let chunk_count = if wire.is_empty() {
        1
    } else {
        wire.len().div_ceil(slice_len)
    } as u32;

    (0..chunk_count)
        .map(|index| {
            let start = index as usize * slice_len;
            let end = (start + slice_len).min(wire.len());
            let slice = &wire[start..end];
            ChunkFrame {
                file_id: header.file_id,
                block_id: header.block_id,
                seq: header.seq,
                chunk_index: index,
                chunk_count,
                chunk_size: slice.len() as u32,
                checksum: header.checksum.clone(),
                payload: URL_SAFE_NO_PAD.encode(slice),
            }
        })
        .collect()
}

/// Raw payload bytes a single frame can carry within `frame_budget`,
/// accounting for base64 expansion and the JSON envelope.
pub fn max_slice_len(frame_budget: usize) -> usize {
    let payload_budget = frame_budget.saturating_sub(FRAME_ENVELOPE_OVERHEAD);
    // base64 encodes 3 raw bytes into 4 characters.
    (payload_budget / 4 * 3).max(1)
}

// ── Reassembly ───────────────────────────────────────────────────────────────

struct PendingBlock {
    slices: Vec<Option<Vec<u8>>>,
    received: u32,
    created_at: Instant,
}

/// Collects chunk frames and produces complete block wire bytes.
///
/// Out-of-order and duplicate frames are tolerated; frames that contradict
/// an earlier frame of the same block (different chunk count) are dropped.
pub struct BlockReassembler {
    pending: HashMap<Uuid, PendingBlock>,
}

impl BlockReassembler {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Accept one frame. Returns the full block wire bytes once the last
    /// missing slice arrives.
    pub fn accept(&mut self, frame: &ChunkFrame) -> Option<Vec<u8>> {
        if frame.chunk_count == 0 || frame.chunk_index >= frame.chunk_count {
            tracing::warn!(
                event = "chunk_frame_rejected",
                block_id = %frame.block_id,
                index = frame.chunk_index,
                count = frame.chunk_count,
                "Chunk frame index outside its declared count"
            );
            return None;
        }

        let slice = URL_SAFE_NO_PAD.decode(&frame.payload).ok()?;
        if slice.len() != frame.chunk_size as usize {
            tracing::warn!(
                event = "chunk_frame_rejected",
                block_id = %frame.block_id,
                "Chunk frame payload length disagrees with chunkSize"
            );
            return None;
        }

        let entry = self.pending.entry(frame.block_id).or_insert_with(|| PendingBlock {
            slices: vec![None; frame.chunk_count as usize],
            received: 0,
            created_at: Instant::now(),
        });

        if entry.slices.len() != frame.chunk_count as usize {
            tracing::warn!(
                event = "chunk_frame_rejected",
                block_id = %frame.block_id,
                "Chunk frame disagrees with earlier frames about chunkCount"
            );
            return None;
        }

        let slot = &mut entry.slices[frame.chunk_index as usize];
        if slot.is_none() {
            *slot = Some(slice);
            entry.received += 1;
        }

        if entry.received == entry.slices.len() as u32 {
            let done = self.pending.remove(&frame.block_id)?;
            let mut wire = Vec::new();
            for slice in done.slices {
                wire.extend_from_slice(&slice?);
            }
            return Some(wire);
        }
        None
    }

    /// Drop partially received blocks older than `max_age`. The sender
    /// re-emits unacknowledged blocks anyway, so stale partials only waste
    /// memory.
    pub fn purge_stale(&mut self, max_age: Duration) {
        self.pending.retain(|_, p| p.created_at.elapsed() < max_age);
    }

    /// Number of blocks with at least one slice outstanding.
    pub fn pending_blocks(&self) -> usize {
        self.pending.len()
    }
}

impl Default for BlockReassembler {
    fn default() -> Self {
        Self::new()
    }
}
