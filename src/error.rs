//! Error families for the transfer engine.
//!
//! Block-level failures are recovered locally via NACK/retransmit and only
//! become terminal for the block after the retransmit cap. Session-level
//! failures surface to the caller with a discrete reason and always leave a
//! final `failed` session row in the journal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal handshake failures. All of these end the session before any block
/// moves.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid peer frame: {0}")]
    InvalidPeerFrame(&'static str),

    #[error("peer frame belongs to a different session")]
    MismatchedSession,

    #[error("ephemeral key generation failed")]
    KeygenFailed,

    #[error("handshake timed out")]
    Timeout,
}

/// Per-block integrity failures, in the order the receiver can hit them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("block authentication failed")]
    DecryptAuthFailed,

    #[error("content hash does not match the block header")]
    HashMismatch,

    #[error("block payload failed to decompress")]
    DecompressFailed,
}

/// Transport-level failures. Never fatal on their own — the engine falls
/// back to the other channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("binary channel closed")]
    BinaryClosed,

    #[error("visual channel closed")]
    VisualClosed,
}

/// Durable-store failures, retried with backoff by the engine.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("journal read failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("journal row corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Terminal assembly failures on the receiver.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("{missing} of {expected} blocks missing at assembly")]
    MissingBlocks { expected: u64, missing: u64 },

    #[error("reassembled file hash does not match the manifest")]
    ManifestMismatch,
}

/// Top-level engine error surfaced to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("journal unavailable: {0}")]
    JournalUnavailable(#[source] JournalError),

    #[error("malformed wire frame: {0}")]
    MalformedFrame(&'static str),

    #[error("AEAD seal failed")]
    SealFailed,
}

/// Wire-level retransmit reason carried in `nack` control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    DecryptFailed,
    HashMismatch,
    DecompressFailed,
    MissingChunk,
}

impl From<BlockError> for NackReason {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::DecryptAuthFailed => NackReason::DecryptFailed,
            BlockError::HashMismatch => NackReason::HashMismatch,
            BlockError::DecompressFailed => NackReason::DecompressFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_reason_wire_names() {
        let json = serde_json::to_string(&NackReason::DecryptFailed).unwrap();
        assert_eq!(json, "\"decrypt_failed\"");
        let json = serde_json::to_string(&NackReason::MissingChunk).unwrap();
        assert_eq!(json, "\"missing_chunk\"");
    }

    #[test]
    fn block_error_maps_to_reason() {
        assert_eq!(
            NackReason::from(BlockError::HashMismatch),
            NackReason::HashMismatch
        );
        assert_eq!(
            NackReason::from(BlockError::DecompressFailed),
            NackReason::DecompressFailed
        );
    }
}
