//! Centralized configuration for the transfer engine.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in
//! a single place. Wire-format constants (protocol tag, algorithm
//! identifiers, frame discriminator bytes) also live here because every
//! module that touches the wire must agree on them.

use std::time::Duration;

// ── Wire identifiers ─────────────────────────────────────────────────────────

/// Protocol tag carried in every block header and used as the HKDF `info`
/// input. Changing it breaks wire compatibility and key derivation at once.
pub const PROTOCOL_TAG: &str = "opticalsend-v1";

/// AEAD identifier carried in the `encryption` header field.
pub const CIPHER_ID: &str = "AES-GCM";

/// Key-agreement identifier carried in the `kdf` header field.
pub const KDF_ID: &str = "ECDH-P256";

/// Handshake nonce length in bytes (salts the HKDF extract step).
pub const HANDSHAKE_NONCE_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const AEAD_NONCE_LEN: usize = 12;

/// Hex characters kept when fingerprinting keys for display and resume
/// matching.
pub const FINGERPRINT_HEX_LEN: usize = 16;

// ── Codec ────────────────────────────────────────────────────────────────────

/// Compression is kept only when the gzipped output is strictly smaller
/// than this fraction of the input. Below that the gzip framing overhead
/// isn't worth carrying.
pub const COMPRESSION_KEEP_RATIO: f64 = 0.95;

// ── Journal retry policy ─────────────────────────────────────────────────────

/// Base delay for journal write retries (doubles per attempt).
pub const JOURNAL_RETRY_BASE: Duration = Duration::from_millis(100);

/// Ceiling for the journal retry delay.
pub const JOURNAL_RETRY_CAP: Duration = Duration::from_secs(5);

/// Attempts before a journal failure becomes fatal to the session.
pub const JOURNAL_RETRY_ATTEMPTS: u32 = 5;

// ── Engine configuration ─────────────────────────────────────────────────────

/// Runtime options for both pipelines. `Default` matches the protocol's
/// documented defaults; tests shrink the timing knobs to keep runs fast.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per chunk before compression.
    pub block_size: usize,
    /// Maximum bytes a single visual frame can carry.
    pub visual_frame_capacity: usize,
    /// Effective visual capacity = capacity × factor. Leaves headroom for
    /// camera lock under imperfect lighting and angles.
    pub visual_safety_factor: f64,
    /// Minimum display time per visual frame.
    pub visual_hold: Duration,
    /// Binary channel backpressure threshold: emission over the binary
    /// channel pauses while `buffered_amount` exceeds this.
    pub binary_watermark: usize,
    /// Emission attempts before a block goes terminal `Skipped`.
    pub max_retransmits_per_block: u32,
    /// Idle cap on the handshake.
    pub handshake_timeout: Duration,
    /// Receiver inactivity window per block before it NACKs the lowest
    /// missing sequence.
    pub block_timeout: Duration,
    /// Liveness heartbeat interval on the binary channel.
    pub heartbeat_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            visual_frame_capacity: 2953,
            visual_safety_factor: 0.6,
            visual_hold: Duration::from_millis(500),
            binary_watermark: 1024 * 1024,
            max_retransmits_per_block: 5,
            handshake_timeout: Duration::from_secs(60),
            block_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Usable bytes per visual frame after the safety factor.
    pub fn effective_frame_budget(&self) -> usize {
        (self.visual_frame_capacity as f64 * self.visual_safety_factor) as usize
    }
}
