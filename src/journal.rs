//! Durable journal: the single source of truth for blocks and sessions.
//!
//! Two tables, both plain JSON on disk:
//! - `sessions.json` — one row per session, keyed by session id.
//! - `blocks-<fileId>.json` — one row per (fileId, seq), the block table
//!   sharded per file so a mutation only rewrites that file's rows.
//!
//! Every mutation rewrites the affected table atomically (temp file, fsync,
//! rename), so a crash mid-write leaves the previous generation intact.
//! `put_block` is idempotent on its (fileId, seq) primary key. In-memory
//! maps mirror the disk state; the engine accesses the journal under
//! single-writer discipline.

use crate::block::{BlockHeader, BlockState};
use crate::error::JournalError;
use crate::session::Session;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One durable block row.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredBlock {
    pub file_id: Uuid,
    pub seq: u64,
    pub header: BlockHeader,
    /// Encrypted payload as received/sent.
    pub payload: Vec<u8>,
    /// Decrypted + decompressed bytes; present only after a successful
    /// receive.
    #[serde(default)]
    pub decoded: Option<Vec<u8>>,
    pub state: BlockState,
}

pub struct Journal {
    root: PathBuf,
    sessions: HashMap<Uuid, Session>,
    blocks: HashMap<Uuid, HashMap<u64, StoredBlock>>,
    closed: bool,
}

impl Journal {
    /// Open (or create) a journal rooted at `root`, loading any existing
    /// tables.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(JournalError::WriteFailed)?;

        let mut journal = Self {
            root,
            sessions: HashMap::new(),
            blocks: HashMap::new(),
            closed: false,
        };
        journal.load()?;
        Ok(journal)
    }

    fn load(&mut self) -> Result<(), JournalError> {
        let sessions_path = self.sessions_path();
        if sessions_path.exists() {
            let raw = std::fs::read(&sessions_path).map_err(JournalError::ReadFailed)?;
            let rows: Vec<Session> = serde_json::from_slice(&raw)?;
            self.sessions = rows.into_iter().map(|s| (s.session_id, s)).collect();
        }

        let entries = std::fs::read_dir(&self.root).map_err(JournalError::ReadFailed)?;
        for entry in entries {
            let entry = entry.map_err(JournalError::ReadFailed)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("blocks-") || !name.ends_with(".json") {
                continue;
            }
            let raw = std::fs::read(entry.path()).map_err(JournalError::ReadFailed)?;
            let rows: Vec<StoredBlock> = serde_json::from_slice(&raw)?;
            for row in rows {
                self.blocks
                    .entry(row.file_id)
                    .or_default()
                    .insert(row.seq, row);
            }
        }

        tracing::debug!(
            event = "journal_loaded",
            sessions = self.sessions.len(),
            files = self.blocks.len(),
            "Journal state loaded"
        );
        Ok(())
    }

    // ── Blocks table ─────────────────────────────────────────────────────

    /// Insert or replace the row for (fileId, seq).
    pub fn put_block(&mut self, row: StoredBlock) -> Result<(), JournalError> {
        self.ensure_open()?;
        let file_id = row.file_id;
        self.blocks.entry(file_id).or_default().insert(row.seq, row);
        self.save_blocks(file_id)
    }

    pub fn get_block(&self, file_id: Uuid, seq: u64) -> Option<&StoredBlock> {
        self.blocks.get(&file_id).and_then(|rows| rows.get(&seq))
    }

    /// All rows for a file, in no particular order; callers re-sort by
    /// sequence.
    pub fn get_blocks_for_file(&self, file_id: Uuid) -> Vec<StoredBlock> {
        self.blocks
            .get(&file_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delete_blocks_for_file(&mut self, file_id: Uuid) -> Result<(), JournalError> {
        self.ensure_open()?;
        self.blocks.remove(&file_id);
        let path = self.blocks_path(file_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(JournalError::WriteFailed)?;
        }
        Ok(())
    }

    // ── Sessions table ───────────────────────────────────────────────────

    pub fn put_session(&mut self, session: Session) -> Result<(), JournalError> {
        self.ensure_open()?;
        self.sessions.insert(session.session_id, session);
        self.save_sessions()
    }

    pub fn get_session(&self, session_id: Uuid) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn get_all_sessions(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }

    pub fn delete_session(&mut self, session_id: Uuid) -> Result<(), JournalError> {
        self.ensure_open()?;
        self.sessions.remove(&session_id);
        self.save_sessions()
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Drop both tables, on disk and in memory.
    pub fn clear_all(&mut self) -> Result<(), JournalError> {
        self.ensure_open()?;
        let file_ids: Vec<Uuid> = self.blocks.keys().copied().collect();
        for file_id in file_ids {
            self.delete_blocks_for_file(file_id)?;
        }
        self.sessions.clear();
        self.save_sessions()
    }

    /// Close the journal. Further mutations fail; reads keep working on the
    /// in-memory snapshot.
    pub fn close(&mut self) {
        self.closed = true;
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), JournalError> {
        if self.closed {
            return Err(JournalError::WriteFailed(std::io::Error::other(
                "journal is closed",
            )));
        }
        Ok(())
    }

    fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    fn blocks_path(&self, file_id: Uuid) -> PathBuf {
        self.root.join(format!("blocks-{file_id}.json"))
    }

    fn save_sessions(&self) -> Result<(), JournalError> {
        let rows: Vec<&Session> = self.sessions.values().collect();
        let content = serde_json::to_vec(&rows)?;
        atomic_write(&self.sessions_path(), &content)
    }

    fn save_blocks(&self, file_id: Uuid) -> Result<(), JournalError> {
        let Some(rows) = self.blocks.get(&file_id) else {
            return Ok(());
        };
        let rows: Vec<&StoredBlock> = rows.values().collect();
        let content = serde_json::to_vec(&rows)?;
        atomic_write(&self.blocks_path(file_id), &content)
    }
}

/// Write-to-temp, fsync, rename. Rename is atomic on every filesystem the
/// journal targets, so readers observe either the old or the new table,
/// never a torn one.
fn atomic_write(path: &Path, content: &[u8]) -> Result<(), JournalError> {
    let tmp = path.with_extension("json.tmp");

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    result.map_err(|e| {
        tracing::error!(
            event = "journal_write_failure",
            path = %path.display(),
            error = %e,
            "Failed to persist journal table"
        );
        let _ = std::fs::remove_file(&tmp);
        JournalError::WriteFailed(e)
    })
}
