//! Transfer engine: shared wire messages, events, commands, progress.
//!
//! The sender and receiver pipelines live in their own modules; this module
//! holds what both sides speak and expose:
//! - `WireMessage` — every JSON frame either channel can carry
//! - the binary-channel envelope (one discriminator byte, then control JSON
//!   or raw block bytes)
//! - `EngineEvent` / `EngineCommand` — the host-facing surface
//! - `TransferProgress` and the pause-aware progress clock

pub mod receiver;
pub mod sender;

pub use receiver::Receiver;
pub use sender::Sender;

use crate::block::Manifest;
use crate::config::{JOURNAL_RETRY_ATTEMPTS, JOURNAL_RETRY_BASE, JOURNAL_RETRY_CAP};
use crate::error::{EngineError, HandshakeError, JournalError, NackReason};
use crate::framing::ChunkFrame;
use crate::handshake::HandshakeFrame;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

// ── Wire messages ────────────────────────────────────────────────────────────

/// Every JSON message the protocol puts on a channel. Visual frames carry
/// these directly; the binary channel wraps the control subset in the
/// envelope below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "handshake")]
    Handshake(HandshakeFrame),

    #[serde(rename = "chunk")]
    Chunk(ChunkFrame),

    /// Preflight notice preceding each binary block payload.
    #[serde(rename = "block-announcement")]
    #[serde(rename_all = "camelCase")]
    BlockAnnouncement {
        block_id: Uuid,
        seq: u64,
        /// Ciphertext + tag length in bytes.
        size: u64,
        /// The block's header checksum.
        checksum: String,
    },

    #[serde(rename = "ack")]
    #[serde(rename_all = "camelCase")]
    Ack { block_id: Uuid, seq: u64 },

    #[serde(rename = "nack")]
    #[serde(rename_all = "camelCase")]
    Nack {
        file_id: Uuid,
        block_id: Option<Uuid>,
        seq: u64,
        reason: NackReason,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(rename = "manifest")]
    Manifest(Manifest),
}

impl WireMessage {
    pub fn to_json(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|_| EngineError::MalformedFrame("message failed to serialize"))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(data).map_err(|_| EngineError::MalformedFrame("message failed to parse"))
    }
}

// ── Binary-channel envelope ──────────────────────────────────────────────────

/// Discriminator for control JSON on the binary channel.
pub(crate) const BINARY_CONTROL: u8 = 0x01;
/// Discriminator for raw block wire bytes on the binary channel.
pub(crate) const BINARY_PAYLOAD: u8 = 0x02;

/// A decoded binary-channel message.
#[derive(Debug)]
pub(crate) enum BinaryMessage {
    Control(WireMessage),
    /// Block wire bytes: header length ‖ header JSON ‖ ciphertext.
    Payload(Vec<u8>),
}

pub(crate) fn encode_binary_control(message: &WireMessage) -> Result<Vec<u8>, EngineError> {
    let json = message.to_json()?;
    let mut out = Vec::with_capacity(1 + json.len());
    out.push(BINARY_CONTROL);
    out.extend_from_slice(&json);
    Ok(out)
}

pub(crate) fn encode_binary_payload(wire: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + wire.len());
    out.push(BINARY_PAYLOAD);
    out.extend_from_slice(wire);
    out
}

pub(crate) fn decode_binary(data: &[u8]) -> Result<BinaryMessage, EngineError> {
    match data.split_first() {
        Some((&BINARY_CONTROL, rest)) => Ok(BinaryMessage::Control(WireMessage::from_json(rest)?)),
        Some((&BINARY_PAYLOAD, rest)) => Ok(BinaryMessage::Payload(rest.to_vec())),
        _ => Err(EngineError::MalformedFrame("unknown binary discriminator")),
    }
}

// ── Host-facing surface ──────────────────────────────────────────────────────

/// Commands the host can issue while a pipeline runs. Observed at the next
/// suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Pause,
    Resume,
    Stop,
}

/// Events streamed to the host while a pipeline runs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Progress(TransferProgress),
    BlockCompleted { seq: u64 },
    /// A block exhausted its retransmit budget.
    BlockSkipped { seq: u64 },
    /// A retransmit round started for `seq`.
    Retransmit { seq: u64, reason: NackReason },
    /// Sender finished; the manifest was emitted.
    Completed { manifest: Manifest },
    /// Receiver assembled and verified the file.
    FileReceived {
        manifest: Manifest,
        data: Vec<u8>,
        sha256: String,
    },
    Failed { reason: String },
}

pub(crate) fn emit(events: &mpsc::UnboundedSender<EngineEvent>, event: EngineEvent) {
    // The host may have dropped its receiver; the pipeline keeps running.
    let _ = events.send(event);
}

/// Live transfer statistics.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub state: SessionState,
    pub percent: f64,
    pub completed_blocks: u64,
    pub failed_blocks: u64,
    pub total_blocks: u64,
    pub retransmits: u64,
    /// Verified payload bytes per second, over unpaused time.
    pub bytes_per_sec: f64,
    pub eta_secs: Option<f64>,
    /// Session key fingerprint, for display beside the progress bar.
    pub fingerprint: String,
}

// ── Handshake over the visual channel ────────────────────────────────────────

/// Emit the sender's opening handshake frame and await the peer's response
/// within `timeout`. Frames that are not handshake frames are skipped while
/// waiting; expiry surfaces as `handshake_timeout`.
pub async fn handshake_over_visual_sender(
    visual: &mut dyn crate::transport::VisualPort,
    session_id: Uuid,
    timeout: std::time::Duration,
) -> Result<crate::crypto::SessionKey, HandshakeError> {
    let mut machine = crate::handshake::HandshakeSender::new(session_id);
    let offer = machine.initiate();
    let bytes = WireMessage::Handshake(offer)
        .to_json()
        .map_err(|_| HandshakeError::InvalidPeerFrame("offer failed to serialize"))?;
    visual
        .send_frame(&bytes)
        .await
        .map_err(|_| HandshakeError::InvalidPeerFrame("visual channel closed"))?;

    let deadline = Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline.into(), visual.next_frame())
            .await
            .map_err(|_| HandshakeError::Timeout)?
            .ok_or(HandshakeError::InvalidPeerFrame("visual channel closed"))?;
        if let Ok(WireMessage::Handshake(peer)) = WireMessage::from_json(&frame) {
            return machine.finalize(&peer);
        }
    }
}

/// Await the sender's opening frame within `timeout`, derive the key, and
/// emit the response frame.
pub async fn handshake_over_visual_receiver(
    visual: &mut dyn crate::transport::VisualPort,
    requested: crate::handshake::RequestedOptions,
    timeout: std::time::Duration,
) -> Result<crate::handshake::HandshakeResponse, HandshakeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline.into(), visual.next_frame())
            .await
            .map_err(|_| HandshakeError::Timeout)?
            .ok_or(HandshakeError::InvalidPeerFrame("visual channel closed"))?;
        if let Ok(WireMessage::Handshake(offer)) = WireMessage::from_json(&frame) {
            let mut machine = crate::handshake::HandshakeReceiver::new();
            let response = machine.respond(&offer, requested)?;
            let bytes = WireMessage::Handshake(response.frame.clone())
                .to_json()
                .map_err(|_| HandshakeError::InvalidPeerFrame("response failed to serialize"))?;
            visual
                .send_frame(&bytes)
                .await
                .map_err(|_| HandshakeError::InvalidPeerFrame("visual channel closed"))?;
            return Ok(response);
        }
    }
}

// ── Pause-aware clock ────────────────────────────────────────────────────────

/// Elapsed-time tracking that freezes across pauses: the pause start is
/// recorded, and the paused span is subtracted once emission resumes.
#[derive(Debug)]
pub(crate) struct ProgressClock {
    started: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl ProgressClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    /// Active (unpaused) time since start.
    pub fn elapsed(&self) -> Duration {
        let gross = self.started.elapsed();
        let paused = self.paused_total
            + self
                .paused_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
        gross.saturating_sub(paused)
    }
}

// ── Journal retry ────────────────────────────────────────────────────────────

/// Run a journal mutation with exponential backoff. Exhausting the retry
/// budget turns a transient storage error into a fatal
/// `journal_unavailable` for the session.
pub(crate) async fn with_journal_retry<T, F>(mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Result<T, JournalError>,
{
    let mut delay = JOURNAL_RETRY_BASE;
    let mut last_err = None;
    for attempt in 0..JOURNAL_RETRY_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    event = "journal_retry",
                    attempt = attempt + 1,
                    error = %e,
                    "Journal operation failed, backing off"
                );
                last_err = Some(e);
                if attempt + 1 < JOURNAL_RETRY_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(JOURNAL_RETRY_CAP);
                }
            }
        }
    }
    Err(EngineError::JournalUnavailable(last_err.expect("at least one attempt ran")))
}
