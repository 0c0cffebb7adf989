//! Cryptographic primitives: key exchange, key derivation, sealing, hashing.
//!
//! Provides:
//! - Ephemeral P-256 key pair generation per session
//! - ECDH key agreement over raw SEC1 points
//! - HKDF-SHA-256 session key derivation, salted by the handshake nonces
//! - AES-256-GCM seal/open with fresh random 96-bit nonces
//! - SHA-256 content hashing and short hex fingerprints
//!
//! The session key never leaves this module in serializable form; only its
//! 16-hex-character fingerprint may persist. All primitives are
//! standards-named — no custom constructions.

use crate::config::{AEAD_NONCE_LEN, FINGERPRINT_HEX_LEN};
use crate::error::{BlockError, EngineError, HandshakeError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

// ── ECDH (P-256) ─────────────────────────────────────────────────────────────

/// An ephemeral P-256 key pair. The secret is consumed by the handshake and
/// never exposed.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    /// Generate a fresh random ephemeral key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// The public key as a raw uncompressed SEC1 point (65 bytes).
    pub fn public_raw(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Perform ECDH with the peer's public key, yielding 256 raw shared
    /// bits. No hashing is applied here; derivation happens in
    /// [`derive_session_key`].
    pub fn diffie_hellman(&self, peer: &PublicKey) -> SharedBits {
        let shared = self.secret.diffie_hellman(peer);
        let mut bits = [0u8; 32];
        bits.copy_from_slice(shared.raw_secret_bytes().as_slice());
        SharedBits(bits)
    }
}

/// Import a peer public key from its raw SEC1 encoding. Rejects malformed
/// encodings and points off the curve.
pub fn import_public_raw(raw: &[u8]) -> Result<PublicKey, HandshakeError> {
    PublicKey::from_sec1_bytes(raw)
        .map_err(|_| HandshakeError::InvalidPeerFrame("public key is not a valid curve point"))
}

/// Raw ECDH output, scrubbed on drop.
pub struct SharedBits([u8; 32]);

impl SharedBits {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedBits {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

// ── Session key (HKDF-SHA-256) ───────────────────────────────────────────────

/// The per-session AEAD key. Held in memory only; dropping it scrubs the
/// bytes. The persistable derivative is [`SessionKey::fingerprint`].
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; 32],
}

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Truncated hash of the key, used to match journaled sessions on
    /// resume. Never reversible into key material.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.key)
    }

    #[cfg(test)]
    pub fn from_bytes_for_tests(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes, even in debug output.
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Derive the 32-byte session key: HKDF-SHA-256 extract with `salt`,
/// expand with `info`.
pub fn derive_session_key(shared: &SharedBits, salt: &[u8], info: &[u8]) -> SessionKey {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("32 bytes is a valid HKDF-SHA-256 output length");
    SessionKey { key }
}

// ── AEAD (AES-256-GCM) ───────────────────────────────────────────────────────

/// Seal `plaintext` under a fresh random 96-bit nonce.
/// Returns (ciphertext‖tag, nonce).
pub fn seal(
    key: &SessionKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; AEAD_NONCE_LEN]), EngineError> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| EngineError::SealFailed)?;
    let mut nonce_bytes = [0u8; AEAD_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EngineError::SealFailed)?;
    Ok((ciphertext, nonce_bytes))
}

/// Open ciphertext‖tag under the given nonce. Any tampering with the
/// ciphertext, tag, or nonce fails authentication.
pub fn open(
    key: &SessionKey,
    data: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN],
) -> Result<Vec<u8>, BlockError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| BlockError::DecryptAuthFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), data)
        .map_err(|_| BlockError::DecryptAuthFailed)
}

// ── Hashing / fingerprints ───────────────────────────────────────────────────

/// SHA-256 digest of arbitrary bytes.
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// SHA-256 digest encoded as 64 lowercase hex characters — the wire and
/// manifest form.
pub fn content_hash_hex(data: &[u8]) -> String {
    hex::encode(content_hash(data))
}

/// Human-comparable fingerprint of a raw public key: the first 16 hex
/// characters of its SHA-256 digest. Displayed on both peers as the final
/// MITM check; the protocol itself does not gate on it.
pub fn public_fingerprint(raw: &[u8]) -> String {
    fingerprint_of(raw)
}

fn fingerprint_of(data: &[u8]) -> String {
    let mut hex = content_hash_hex(data);
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}
