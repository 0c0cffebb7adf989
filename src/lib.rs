//! OpticalSend: dual-channel encrypted file transfer engine.
//!
//! Transfers finite files between two peers over a visual channel (QR
//! frames in/out) and an optional ordered binary channel, redundantly. The
//! payload is end-to-end encrypted under a key from an in-band ECDH
//! handshake; every block is independently authenticated, checksummed, and
//! journaled so transfers survive loss, reordering, pauses, and process
//! restarts.
//!
//! The engine is transport-agnostic: QR rendering/scanning and data-channel
//! signaling live in the host, which bridges them through the
//! [`transport::VisualPort`] / [`transport::BinaryPort`] traits.
//!
//! Typical flow:
//! 1. Run the two-frame [`handshake`] to derive the session key.
//! 2. Hand the key, a [`journal::Journal`], and the transport ports to
//!    [`engine::Sender`] or [`engine::Receiver`].
//! 3. Drive `run()`; watch [`engine::EngineEvent`]s, steer with
//!    [`engine::EngineCommand`]s.

pub mod block;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod journal;
pub mod session;
pub mod transport;

pub use block::{BlockHeader, BlockState, Manifest};
pub use config::EngineConfig;
pub use engine::{
    handshake_over_visual_receiver, handshake_over_visual_sender, receiver::resumable_sessions,
    EngineCommand, EngineEvent, Receiver, Sender, TransferProgress,
};
pub use error::{
    AssemblyError, BlockError, EngineError, HandshakeError, JournalError, NackReason,
    TransportError,
};
pub use handshake::{HandshakeReceiver, HandshakeSender, RequestedOptions};
pub use journal::Journal;
pub use session::{Role, Session, SessionState};
