//! Session records and lifecycle.
//!
//! A session is one transfer of one file between two peers. It is created
//! at handshake finalization, mutated by the transfer engine, and ends in
//! `Completed` or `Failed`. The derived key never appears here — only its
//! truncated fingerprint, which is what resume matching compares.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All states a session can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created at handshake finalization, transfer not yet started.
    Pending,
    /// Blocks are moving.
    Active,
    /// Emission suspended, eligible for resume.
    Paused,
    /// All blocks verified and assembled.
    Completed,
    /// Terminal failure; `error_reason` names the cause.
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// Which end of the transfer this session row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

/// The durable session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: Uuid,
    pub role: Role,
    pub file_id: Uuid,
    pub filename: String,
    pub total_size: u64,
    pub total_blocks: u64,
    /// Truncated hash of the derived session key — never the key itself.
    pub symmetric_key_derivative: String,
    pub created_at: String,
    pub updated_at: String,
    pub state: SessionState,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl Session {
    pub fn new(
        role: Role,
        file_id: Uuid,
        filename: String,
        total_size: u64,
        total_blocks: u64,
        key_fingerprint: String,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            session_id: Uuid::new_v4(),
            role,
            file_id,
            filename,
            total_size,
            total_blocks,
            symmetric_key_derivative: key_fingerprint,
            created_at: now.clone(),
            updated_at: now,
            state: SessionState::Pending,
            error_reason: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Start (or restart after a pause) emitting blocks.
    pub fn activate(&mut self) {
        if matches!(self.state, SessionState::Pending | SessionState::Paused) {
            self.state = SessionState::Active;
            self.touch();
        }
    }

    /// Suspend emission; the session stays eligible for resume.
    pub fn pause(&mut self) {
        if self.state == SessionState::Active {
            self.state = SessionState::Paused;
            self.touch();
        }
    }

    pub fn complete(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Completed;
            self.touch();
        }
    }

    pub fn fail(&mut self, reason: &str) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
            self.error_reason = Some(reason.to_string());
            self.touch();
        }
    }

    /// Whether a freshly derived key adopts this session's journaled
    /// progress. Only non-terminal sessions with a matching key derivative
    /// qualify.
    pub fn matches_key(&self, key_fingerprint: &str) -> bool {
        !self.state.is_terminal() && self.symmetric_key_derivative == key_fingerprint
    }
}
