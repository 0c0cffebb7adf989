//! Two-message handshake: ephemeral ECDH with nonce-salted HKDF.
//!
//! ```text
//! Sender                                Receiver
//! ──────                                ────────
//! {role: sender, pubKey A, nonce N_S} ──────────►
//! ◄────────── {role: receiver, pubKey B, nonce N_R, ack}
//!
//! shared      = ECDH(sk, peer_pk)
//! salt        = SHA-256(N_S ‖ N_R)
//! session_key = HKDF-SHA-256(shared, salt, "opticalsend-v1")
//! ```
//!
//! Both sides confirm equal keys implicitly through the first successful
//! AEAD open. The displayed public-key fingerprints are the users' final
//! MITM defense; the protocol does not gate on them.

use crate::codec::Compression;
use crate::config::{HANDSHAKE_NONCE_LEN, PROTOCOL_TAG};
use crate::crypto::{self, EphemeralKeypair, SessionKey};
use crate::error::HandshakeError;
use crate::session::Role;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Block sizes a peer may request; the sender's configured size must be
/// offered here.
pub const SUPPORTED_BLOCK_SIZES: [usize; 4] = [512, 1024, 2048, 4096];

// ── Wire frame ───────────────────────────────────────────────────────────────

/// Options the receiver asks for in its response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedOptions {
    pub block_size: usize,
    pub prefer_compression: bool,
}

/// The handshake frame, carried on the visual channel in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeFrame {
    pub role: Role,
    pub file_session_id: Uuid,
    /// Base64 (URL-safe, no padding) raw SEC1 public point.
    pub pub_key: String,
    /// Base64 (URL-safe, no padding) 16-byte handshake nonce.
    pub nonce: String,
    pub offered_compression: Vec<Compression>,
    pub supported_block_sizes: Vec<usize>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_options: Option<RequestedOptions>,
}

impl HandshakeFrame {
    fn decode_pub_key(&self) -> Result<Vec<u8>, HandshakeError> {
        URL_SAFE_NO_PAD
            .decode(&self.pub_key)
            .map_err(|_| HandshakeError::InvalidPeerFrame("public key is not valid base64"))
    }

    fn decode_nonce(&self) -> Result<[u8; HANDSHAKE_NONCE_LEN], HandshakeError> {
        let raw = URL_SAFE_NO_PAD
            .decode(&self.nonce)
            .map_err(|_| HandshakeError::InvalidPeerFrame("nonce is not valid base64"))?;
        raw.try_into()
            .map_err(|_| HandshakeError::InvalidPeerFrame("nonce is not 16 bytes"))
    }

    /// Human-comparable fingerprint of the carried public key.
    pub fn fingerprint(&self) -> Result<String, HandshakeError> {
        Ok(crypto::public_fingerprint(&self.decode_pub_key()?))
    }
}

fn fresh_nonce() -> [u8; HANDSHAKE_NONCE_LEN] {
    let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// salt = SHA-256(N_S ‖ N_R), sender nonce first on both sides.
fn handshake_salt(
    sender_nonce: &[u8; HANDSHAKE_NONCE_LEN],
    receiver_nonce: &[u8; HANDSHAKE_NONCE_LEN],
) -> [u8; 32] {
    let mut joined = [0u8; HANDSHAKE_NONCE_LEN * 2];
    joined[..HANDSHAKE_NONCE_LEN].copy_from_slice(sender_nonce);
    joined[HANDSHAKE_NONCE_LEN..].copy_from_slice(receiver_nonce);
    crypto::content_hash(&joined)
}

// ── Sender side ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderHandshakeState {
    Idle,
    AwaitingPeer,
    Finalized,
    Failed,
}

/// Sender half of the handshake: `idle → awaiting_peer → finalized | failed`.
/// Owns the ephemeral private key; it is destroyed at finalization.
pub struct HandshakeSender {
    session_id: Uuid,
    state: SenderHandshakeState,
    keypair: Option<EphemeralKeypair>,
    nonce: [u8; HANDSHAKE_NONCE_LEN],
}

impl HandshakeSender {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: SenderHandshakeState::Idle,
            keypair: None,
            nonce: [0u8; HANDSHAKE_NONCE_LEN],
        }
    }

    pub fn state(&self) -> SenderHandshakeState {
        self.state
    }

    /// Generate the ephemeral key pair and emit the opening frame.
    pub fn initiate(&mut self) -> HandshakeFrame {
        let keypair = EphemeralKeypair::generate();
        self.nonce = fresh_nonce();
        let frame = HandshakeFrame {
            role: Role::Sender,
            file_session_id: self.session_id,
            pub_key: URL_SAFE_NO_PAD.encode(keypair.public_raw()),
            nonce: URL_SAFE_NO_PAD.encode(self.nonce),
            offered_compression: vec![Compression::Gzip, Compression::None],
            supported_block_sizes: SUPPORTED_BLOCK_SIZES.to_vec(),
            timestamp: Utc::now().to_rfc3339(),
            ack: None,
            requested_options: None,
        };
        self.keypair = Some(keypair);
        self.state = SenderHandshakeState::AwaitingPeer;
        frame
    }

    /// Consume the peer's response and derive the session key. Any
    /// validation failure is terminal for the handshake.
    pub fn finalize(&mut self, peer: &HandshakeFrame) -> Result<SessionKey, HandshakeError> {
        let result = self.try_finalize(peer);
        match &result {
            Ok(_) => self.state = SenderHandshakeState::Finalized,
            Err(e) => {
                tracing::warn!(
                    event = "handshake_failed",
                    session_id = %self.session_id,
                    error = %e,
                    "Sender handshake failed"
                );
                self.state = SenderHandshakeState::Failed;
            }
        }
        result
    }

    fn try_finalize(&mut self, peer: &HandshakeFrame) -> Result<SessionKey, HandshakeError> {
        if self.state != SenderHandshakeState::AwaitingPeer {
            return Err(HandshakeError::InvalidPeerFrame("handshake not in progress"));
        }
        if peer.role != Role::Receiver {
            return Err(HandshakeError::InvalidPeerFrame("expected a receiver frame"));
        }
        if peer.file_session_id != self.session_id {
            return Err(HandshakeError::MismatchedSession);
        }

        let peer_public = crypto::import_public_raw(&peer.decode_pub_key()?)?;
        let peer_nonce = peer.decode_nonce()?;

        let keypair = self
            .keypair
            .take()
            .ok_or(HandshakeError::KeygenFailed)?;
        let shared = keypair.diffie_hellman(&peer_public);
        let salt = handshake_salt(&self.nonce, &peer_nonce);
        Ok(crypto::derive_session_key(&shared, &salt, PROTOCOL_TAG.as_bytes()))
    }
}

// ── Receiver side ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverHandshakeState {
    Idle,
    Responded,
    Failed,
}

/// Everything the receiver produces from one scanned sender frame.
pub struct HandshakeResponse {
    pub frame: HandshakeFrame,
    pub session_key: SessionKey,
    pub session_id: Uuid,
}

/// Receiver half of the handshake: `idle → responded | failed`. One scanned
/// sender frame yields the response frame and the derived key together.
pub struct HandshakeReceiver {
    state: ReceiverHandshakeState,
}

impl HandshakeReceiver {
    pub fn new() -> Self {
        Self {
            state: ReceiverHandshakeState::Idle,
        }
    }

    pub fn state(&self) -> ReceiverHandshakeState {
        self.state
    }

    pub fn respond(
        &mut self,
        sender_frame: &HandshakeFrame,
        requested: RequestedOptions,
    ) -> Result<HandshakeResponse, HandshakeError> {
        let result = Self::try_respond(sender_frame, requested);
        match &result {
            Ok(_) => self.state = ReceiverHandshakeState::Responded,
            Err(e) => {
                tracing::warn!(
                    event = "handshake_failed",
                    session_id = %sender_frame.file_session_id,
                    error = %e,
                    "Receiver handshake failed"
                );
                self.state = ReceiverHandshakeState::Failed;
            }
        }
        result
    }

    fn try_respond(
        sender_frame: &HandshakeFrame,
        requested: RequestedOptions,
    ) -> Result<HandshakeResponse, HandshakeError> {
        if sender_frame.role != Role::Sender {
            return Err(HandshakeError::InvalidPeerFrame("expected a sender frame"));
        }

        let peer_public = crypto::import_public_raw(&sender_frame.decode_pub_key()?)?;
        let sender_nonce = sender_frame.decode_nonce()?;

        let keypair = EphemeralKeypair::generate();
        let receiver_nonce = fresh_nonce();

        let shared = keypair.diffie_hellman(&peer_public);
        let salt = handshake_salt(&sender_nonce, &receiver_nonce);
        let session_key = crypto::derive_session_key(&shared, &salt, PROTOCOL_TAG.as_bytes());

        let frame = HandshakeFrame {
            role: Role::Receiver,
            file_session_id: sender_frame.file_session_id,
            pub_key: URL_SAFE_NO_PAD.encode(keypair.public_raw()),
            nonce: URL_SAFE_NO_PAD.encode(receiver_nonce),
            offered_compression: vec![Compression::Gzip, Compression::None],
            supported_block_sizes: SUPPORTED_BLOCK_SIZES.to_vec(),
            timestamp: Utc::now().to_rfc3339(),
            ack: Some(true),
            requested_options: Some(requested),
        };

        Ok(HandshakeResponse {
            frame,
            session_key,
            session_id: sender_frame.file_session_id,
        })
    }
}

impl Default for HandshakeReceiver {
    fn default() -> Self {
        Self::new()
    }
}
