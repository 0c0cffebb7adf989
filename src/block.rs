//! Block model: the canonical unit of transfer.
//!
//! Each block is one contiguous slice of the file run through
//! compress → hash → encrypt. The header binds sequence identity and
//! integrity fields; the checksum covers the compressed *pre-encryption*
//! bytes so the receiver can verify after decryption but before
//! decompression — tampering is caught ahead of any decoder quirks, and
//! compression bombs are detectable before expansion.

use crate::codec::{self, Compression};
use crate::config::{AEAD_NONCE_LEN, CIPHER_ID, KDF_ID, PROTOCOL_TAG};
use crate::crypto::{self, SessionKey};
use crate::error::{BlockError, EngineError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Wire header ──────────────────────────────────────────────────────────────

/// On-wire block header. Immutable once emitted; retransmits reuse the
/// original header and ciphertext untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Constant protocol tag (`"opticalsend-v1"`).
    pub protocol: String,
    pub file_id: Uuid,
    pub block_id: Uuid,
    /// 0-based sequence index within the file.
    pub seq: u64,
    /// Total block count for the file; sequences are dense in `[0, totalSeq)`.
    pub total_seq: u64,
    /// Bytes of ciphertext + tag.
    pub payload_size: u64,
    /// Bytes of the original chunk, before compression.
    pub raw_size: u64,
    pub compression: Compression,
    /// AEAD identifier (`"AES-GCM"`).
    pub encryption: String,
    /// Base64 (URL-safe, no padding) of the 96-bit AEAD nonce.
    pub iv: String,
    /// Key-agreement identifier (`"ECDH-P256"`).
    pub kdf: String,
    /// SHA-256 hex of the compressed pre-encryption bytes.
    pub checksum: String,
    /// ISO-8601 creation timestamp.
    pub timestamp: String,
}

impl BlockHeader {
    /// Decode the AEAD nonce from the `iv` field.
    pub fn nonce(&self) -> Result<[u8; AEAD_NONCE_LEN], BlockError> {
        let raw = URL_SAFE_NO_PAD
            .decode(&self.iv)
            .map_err(|_| BlockError::DecryptAuthFailed)?;
        raw.try_into().map_err(|_| BlockError::DecryptAuthFailed)
    }
}

// ── Block state ──────────────────────────────────────────────────────────────

/// Lifecycle of a single block on either side of the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Pending,
    Queued,
    Sending,
    Completed,
    Failed,
    Skipped,
}

impl BlockState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockState::Completed | BlockState::Skipped)
    }
}

// ── In-memory record ─────────────────────────────────────────────────────────

/// A block held by the sender: header + ciphertext plus delivery
/// bookkeeping. The journal row is the durable view; this is the working
/// copy the send queue owns.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
    pub state: BlockState,
    /// Emission rounds attempted (initial send + retransmits).
    pub attempts: u32,
    pub sent_over_binary: bool,
    pub sent_over_visual: bool,
    pub verified: bool,
    pub last_error: Option<String>,
    pub retransmits: u32,
}

impl BlockRecord {
    pub fn new(header: BlockHeader, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload,
            state: BlockState::Pending,
            attempts: 0,
            sent_over_binary: false,
            sent_over_visual: false,
            verified: false,
            last_error: None,
            retransmits: 0,
        }
    }
}

// ── Chunking ─────────────────────────────────────────────────────────────────

/// Number of blocks a file of `len` bytes yields at the given block size.
/// A zero-byte file yields exactly one zero-length block, so every transfer
/// has a dense, non-empty sequence range.
pub fn chunk_count(len: usize, block_size: usize) -> u64 {
    (len.div_ceil(block_size) as u64).max(1)
}

/// Byte range of block `seq` within a file of `len` bytes.
pub fn chunk_span(seq: u64, len: usize, block_size: usize) -> (usize, usize) {
    let start = (seq as usize * block_size).min(len);
    let end = (start + block_size).min(len);
    (start, end)
}

// ── Seal / open ──────────────────────────────────────────────────────────────

/// Run one chunk through the sender pipeline:
/// compress → hash compressed → encrypt → assemble header.
pub fn seal_block(
    key: &SessionKey,
    file_id: Uuid,
    seq: u64,
    total_seq: u64,
    chunk: &[u8],
) -> Result<BlockRecord, EngineError> {
    let (compression, compressed) = codec::select_best(chunk);
    let checksum = crypto::content_hash_hex(&compressed);
    let (ciphertext, nonce) = crypto::seal(key, &compressed)?;

    let header = BlockHeader {
        protocol: PROTOCOL_TAG.to_string(),
        file_id,
        block_id: Uuid::new_v4(),
        seq,
        total_seq,
        payload_size: ciphertext.len() as u64,
        raw_size: chunk.len() as u64,
        compression,
        encryption: CIPHER_ID.to_string(),
        iv: URL_SAFE_NO_PAD.encode(nonce),
        kdf: KDF_ID.to_string(),
        checksum,
        timestamp: Utc::now().to_rfc3339(),
    };

    Ok(BlockRecord::new(header, ciphertext))
}

/// Run one received block through the receiver pipeline:
/// authenticate+decrypt → recompute checksum → decompress.
/// The order is deliberate; each stage maps to its own NACK reason.
pub fn open_block(
    key: &SessionKey,
    header: &BlockHeader,
    ciphertext: &[u8],
) -> Result<Vec<u8>, BlockError> {
    let nonce = header.nonce()?;
    let compressed = crypto::open(key, ciphertext, &nonce)?;

    if crypto::content_hash_hex(&compressed) != header.checksum {
        return Err(BlockError::HashMismatch);
    }

    codec::decode(header.compression, &compressed)
}

// ── Block wire form ──────────────────────────────────────────────────────────

/// Serialize a block for transport: `u32 BE header length ‖ header JSON ‖
/// ciphertext`. Both channels carry these bytes — the visual path splits
/// them across frames, the binary path sends them as one payload message.
pub fn encode_wire(header: &BlockHeader, ciphertext: &[u8]) -> Result<Vec<u8>, EngineError> {
    let header_json = serde_json::to_vec(header)
        .map_err(|_| EngineError::MalformedFrame("block header failed to serialize"))?;
    let mut out = Vec::with_capacity(4 + header_json.len() + ciphertext.len());
    out.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Parse the block wire form back into header + ciphertext.
pub fn decode_wire(data: &[u8]) -> Result<(BlockHeader, Vec<u8>), EngineError> {
    if data.len() < 4 {
        return Err(EngineError::MalformedFrame("block shorter than length prefix"));
    }
    let header_len = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
    let rest = &data[4..];
    if rest.len() < header_len {
        return Err(EngineError::MalformedFrame("block header truncated"));
    }
    let header: BlockHeader = serde_json::from_slice(&rest[..header_len])
        .map_err(|_| EngineError::MalformedFrame("block header failed to parse"))?;
    Ok((header, rest[header_len..].to_vec()))
}

// ── Manifest ─────────────────────────────────────────────────────────────────

/// End-of-transfer record binding file identity to whole-file integrity.
/// Validated at assembly time; a mismatch fails the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub file_id: Uuid,
    pub filename: String,
    pub total_size: u64,
    pub total_blocks: u64,
    /// Whole-file SHA-256 digest, hex.
    pub sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SessionKey {
        SessionKey::from_bytes_for_tests([42u8; 32])
    }

    #[test]
    fn chunk_count_boundaries() {
        assert_eq!(chunk_count(0, 1024), 1);
        assert_eq!(chunk_count(1, 1024), 1);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(3 * 1024, 1024), 3);
        assert_eq!(chunk_count(3 * 1024 + 1, 1024), 4);
    }

    #[test]
    fn chunk_span_covers_file_densely() {
        let len = 2500;
        let total = chunk_count(len, 1024);
        let mut covered = 0;
        for seq in 0..total {
            let (start, end) = chunk_span(seq, len, 1024);
            assert_eq!(start, covered);
            covered = end;
        }
        assert_eq!(covered, len);
        // Last block of a k·b + 1 file is exactly one byte.
        let (start, end) = chunk_span(2, 2049, 1024);
        assert_eq!(end - start, 1);
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key();
        let chunk = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let record = seal_block(&key, Uuid::new_v4(), 0, 1, &chunk).unwrap();

        assert_eq!(record.header.raw_size, 8);
        assert_eq!(record.header.seq, 0);
        assert_eq!(record.header.total_seq, 1);
        // Incompressible 8 bytes stay raw: ciphertext is payload + 16-byte tag.
        assert_eq!(record.header.compression, Compression::None);
        assert_eq!(record.payload.len(), 8 + 16);
        assert_eq!(record.header.payload_size, record.payload.len() as u64);

        let decoded = open_block(&key, &record.header, &record.payload).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn open_rejects_ciphertext_corruption() {
        let key = test_key();
        let record = seal_block(&key, Uuid::new_v4(), 0, 1, b"payload bytes").unwrap();
        let mut corrupted = record.payload.clone();
        corrupted[0] ^= 0x01;
        assert_eq!(
            open_block(&key, &record.header, &corrupted).unwrap_err(),
            BlockError::DecryptAuthFailed
        );
    }

    #[test]
    fn open_rejects_checksum_tamper() {
        let key = test_key();
        let mut record = seal_block(&key, Uuid::new_v4(), 0, 1, b"payload bytes").unwrap();
        record.header.checksum = crypto::content_hash_hex(b"something else");
        assert_eq!(
            open_block(&key, &record.header, &record.payload).unwrap_err(),
            BlockError::HashMismatch
        );
    }

    #[test]
    fn open_compressed_block() {
        let key = test_key();
        let chunk = vec![0x41u8; 1000];
        let record = seal_block(&key, Uuid::new_v4(), 2, 5, &chunk).unwrap();
        assert_eq!(record.header.compression, Compression::Gzip);
        assert_eq!(open_block(&key, &record.header, &record.payload).unwrap(), chunk);
    }

    #[test]
    fn header_wire_field_names() {
        let key = test_key();
        let record = seal_block(&key, Uuid::new_v4(), 0, 1, b"x").unwrap();
        let json = serde_json::to_value(&record.header).unwrap();
        for field in [
            "protocol", "fileId", "blockId", "seq", "totalSeq", "payloadSize",
            "rawSize", "compression", "encryption", "iv", "kdf", "checksum",
            "timestamp",
        ] {
            assert!(json.get(field).is_some(), "missing wire field {field}");
        }
        assert_eq!(json["protocol"], "opticalsend-v1");
        assert_eq!(json["encryption"], "AES-GCM");
        assert_eq!(json["kdf"], "ECDH-P256");
        assert_eq!(json["checksum"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn wire_encode_decode_roundtrip() {
        let key = test_key();
        let record = seal_block(&key, Uuid::new_v4(), 1, 3, b"wire bytes").unwrap();
        let wire = encode_wire(&record.header, &record.payload).unwrap();
        let (header, ciphertext) = decode_wire(&wire).unwrap();
        assert_eq!(header, record.header);
        assert_eq!(ciphertext, record.payload);
    }

    #[test]
    fn decode_wire_rejects_truncation() {
        let key = test_key();
        let record = seal_block(&key, Uuid::new_v4(), 0, 1, b"wire bytes").unwrap();
        let wire = encode_wire(&record.header, &record.payload).unwrap();
        assert!(decode_wire(&wire[..2]).is_err());
        assert!(decode_wire(&wire[..10]).is_err());
    }

    #[test]
    fn zero_length_chunk_seals() {
        let key = test_key();
        let record = seal_block(&key, Uuid::new_v4(), 0, 1, &[]).unwrap();
        assert_eq!(record.header.raw_size, 0);
        // Tag-only ciphertext.
        assert_eq!(record.payload.len(), 16);
        assert_eq!(open_block(&key, &record.header, &record.payload).unwrap(), Vec::<u8>::new());
    }
}
