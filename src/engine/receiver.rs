//! Receiver pipeline: verify → journal → acknowledge → assemble.
//!
//! Incoming blocks arrive from either channel — reassembled visual chunk
//! frames or binary payload messages — and run through the same
//! verification order: AEAD open, checksum compare, decompress. A verified
//! block is journaled with its decoded bytes before the ACK goes out, so a
//! crash can never acknowledge data it did not keep. Duplicate deliveries
//! across channels are idempotent on the (fileId, seq) journal key.
//!
//! Once the completed set covers the dense sequence range and the manifest
//! has arrived, assembly concatenates the journaled payloads, hashes the
//! whole file, and compares against the manifest.

use crate::block::{decode_wire, open_block, BlockHeader, BlockState, Manifest};
use crate::config::EngineConfig;
use crate::crypto::{content_hash_hex, SessionKey};
use crate::engine::{
    decode_binary, emit, encode_binary_control, with_journal_retry, BinaryMessage, EngineCommand,
    EngineEvent, ProgressClock, TransferProgress, WireMessage,
};
use crate::error::{AssemblyError, BlockError, EngineError, NackReason};
use crate::framing::BlockReassembler;
use crate::journal::{Journal, StoredBlock};
use crate::session::{Role, Session, SessionState};
use crate::transport::{BinaryPort, VisualPort};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Host-side handle to a running receiver.
pub struct ReceiverHandle {
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub commands: mpsc::UnboundedSender<EngineCommand>,
}

/// Word-packed bitmap over the dense sequence range; the sparse in-memory
/// view of which journal rows are `Completed`.
struct SeqBitmap {
    total: u64,
    words: Vec<u64>,
}

impl SeqBitmap {
    fn new(total: u64) -> Self {
        Self {
            total,
            words: vec![0u64; (total as usize).div_ceil(64)],
        }
    }

    fn set(&mut self, seq: u64) {
        if seq < self.total {
            self.words[(seq / 64) as usize] |= 1u64 << (seq % 64);
        }
    }

    fn is_set(&self, seq: u64) -> bool {
        seq < self.total && (self.words[(seq / 64) as usize] >> (seq % 64)) & 1 == 1
    }

    fn count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    fn is_complete(&self) -> bool {
        self.count() == self.total
    }

    fn lowest_missing(&self) -> Option<u64> {
        (0..self.total).find(|&seq| !self.is_set(seq))
    }
}

/// Per-file receive state, created from the first block header.
struct FileTracker {
    file_id: Uuid,
    total_seq: u64,
    bitmap: SeqBitmap,
    decoded_bytes: u64,
}

enum Pumped {
    Command(EngineCommand),
    CommandsClosed,
    Visual(Option<Vec<u8>>),
    Binary(Option<Vec<u8>>),
    Deadline,
}

/// Why the run loop ended.
enum Outcome {
    Assembled,
    Failed(String),
}

pub struct Receiver {
    config: EngineConfig,
    key: SessionKey,
    session: Session,
    journal: Journal,
    visual: Box<dyn VisualPort>,
    binary: Option<Box<dyn BinaryPort>>,
    reassembler: BlockReassembler,
    tracker: Option<FileTracker>,
    manifest: Option<Manifest>,
    /// Announcement awaiting its payload on the binary channel.
    pending_announcement: Option<Uuid>,
    events: mpsc::UnboundedSender<EngineEvent>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    clock: ProgressClock,
    paused: bool,
    stopping: bool,
    visual_inbound_closed: bool,
    commands_closed: bool,
    last_progress: Instant,
    /// Once the manifest has arrived with blocks still missing, assembly is
    /// forced (and fails) after this deadline — the sender has finished.
    manifest_deadline: Option<Instant>,
    retransmit_requests: u64,
}

impl Receiver {
    /// Create the receiver side of a finalized handshake. The session row
    /// is journaled immediately; file identity fills in when the first
    /// block header arrives.
    pub async fn new(
        session_id: Uuid,
        key: SessionKey,
        mut journal: Journal,
        config: EngineConfig,
        visual: Box<dyn VisualPort>,
        binary: Option<Box<dyn BinaryPort>>,
    ) -> Result<(Self, ReceiverHandle), EngineError> {
        let mut session = Session::new(
            Role::Receiver,
            Uuid::nil(),
            String::new(),
            0,
            0,
            key.fingerprint(),
        );
        session.session_id = session_id;
        with_journal_retry(|| journal.put_session(session.clone())).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let receiver = Self {
            config,
            key,
            session,
            journal,
            visual,
            binary,
            reassembler: BlockReassembler::new(),
            tracker: None,
            manifest: None,
            pending_announcement: None,
            events: events_tx,
            commands: commands_rx,
            clock: ProgressClock::start(),
            paused: false,
            stopping: false,
            visual_inbound_closed: false,
            commands_closed: false,
            last_progress: Instant::now(),
            manifest_deadline: None,
            retransmit_requests: 0,
        };
        Ok((
            receiver,
            ReceiverHandle {
                events: events_rx,
                commands: commands_tx,
            },
        ))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drive reception until assembly succeeds, fails, or the host stops
    /// the session. As on the sender, protocol outcomes live in the
    /// returned session row; only infrastructure failures are `Err`.
    pub async fn run(mut self) -> Result<Session, EngineError> {
        match self.run_inner().await {
            Ok(Outcome::Assembled) => Ok(self.session),
            Ok(Outcome::Failed(reason)) => {
                self.session.fail(&reason);
                let row = self.session.clone();
                let _ = self.journal.put_session(row);
                emit(&self.events, EngineEvent::Failed { reason });
                Ok(self.session)
            }
            Err(e) => {
                let reason = match &e {
                    EngineError::JournalUnavailable(_) => "journal_unavailable".to_string(),
                    other => other.to_string(),
                };
                self.session.fail(&reason);
                let row = self.session.clone();
                let _ = self.journal.put_session(row);
                emit(&self.events, EngineEvent::Failed { reason });
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<Outcome, EngineError> {
        loop {
            if self.stopping {
                return Ok(Outcome::Failed("stopped".into()));
            }

            if self.transfer_complete() {
                return self.assemble().await;
            }

            let deadline = self.next_deadline();
            let pumped = self.pump(deadline).await;
            match pumped {
                Pumped::Command(cmd) => self.handle_command(cmd).await?,
                Pumped::CommandsClosed => self.commands_closed = true,
                Pumped::Visual(None) => {
                    self.visual_inbound_closed = true;
                    if self.binary.is_none() {
                        return self.transports_gone().await;
                    }
                }
                Pumped::Visual(Some(bytes)) => self.handle_visual_frame(&bytes).await?,
                Pumped::Binary(None) => {
                    tracing::info!(event = "binary_channel_closed", "Binary channel ended");
                    self.binary = None;
                    if self.visual_inbound_closed {
                        return self.transports_gone().await;
                    }
                }
                Pumped::Binary(Some(bytes)) => self.handle_binary_message(&bytes).await?,
                Pumped::Deadline => {
                    if let Some(outcome) = self.handle_deadline().await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Both inbound channels have ended. With a manifest in hand the sender
    /// is done and assembly pronounces the verdict; without one nothing
    /// more can arrive.
    async fn transports_gone(&mut self) -> Result<Outcome, EngineError> {
        if self.manifest.is_some() {
            self.assemble().await
        } else {
            Ok(Outcome::Failed("transport_closed".into()))
        }
    }

    // ── Inbound handling ─────────────────────────────────────────────────

    async fn handle_visual_frame(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let message = match WireMessage::from_json(bytes) {
            Ok(message) => message,
            Err(_) => {
                tracing::debug!(event = "visual_frame_undecodable", "Dropping unparseable frame");
                return Ok(());
            }
        };
        match message {
            WireMessage::Chunk(frame) => {
                if self.paused {
                    return Ok(());
                }
                if let Some(wire) = self.reassembler.accept(&frame) {
                    match decode_wire(&wire) {
                        Ok((header, ciphertext)) => {
                            self.process_block(header, ciphertext).await?;
                        }
                        Err(_) => {
                            tracing::warn!(
                                event = "block_wire_undecodable",
                                block_id = %frame.block_id,
                                "Reassembled block failed to parse, awaiting retransmit"
                            );
                        }
                    }
                }
            }
            WireMessage::Manifest(manifest) => self.accept_manifest(manifest).await?,
            WireMessage::Heartbeat => {}
            other => {
                tracing::debug!(event = "unexpected_visual_message", ?other, "Ignoring");
            }
        }
        Ok(())
    }

    async fn handle_binary_message(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let message = match decode_binary(bytes) {
            Ok(message) => message,
            Err(_) => {
                tracing::debug!(event = "binary_message_undecodable", "Dropping message");
                return Ok(());
            }
        };
        match message {
            BinaryMessage::Control(WireMessage::BlockAnnouncement { block_id, seq, .. }) => {
                // Announcement → payload → next announcement, serialized
                // per channel. The announcement is advisory preflight; the
                // payload's own header is authoritative.
                if let Some(previous) = self.pending_announcement.replace(block_id) {
                    tracing::warn!(
                        event = "announcement_unpaired",
                        block_id = %previous,
                        "Announcement arrived with an earlier one still unpaired"
                    );
                }
                tracing::trace!(event = "block_announced", %block_id, seq, "Block announced");
            }
            BinaryMessage::Control(WireMessage::Manifest(manifest)) => {
                self.accept_manifest(manifest).await?;
            }
            BinaryMessage::Control(WireMessage::Heartbeat) => {
                tracing::trace!(event = "heartbeat", "Sender liveness");
            }
            BinaryMessage::Control(other) => {
                tracing::debug!(event = "unexpected_binary_control", ?other, "Ignoring");
            }
            BinaryMessage::Payload(wire) => {
                if self.paused {
                    return Ok(());
                }
                match decode_wire(&wire) {
                    Ok((header, ciphertext)) => {
                        match self.pending_announcement.take() {
                            Some(announced) if announced == header.block_id => {}
                            Some(announced) => {
                                tracing::warn!(
                                    event = "announcement_mismatch",
                                    announced = %announced,
                                    received = %header.block_id,
                                    "Payload does not match the pending announcement"
                                );
                            }
                            None => {
                                tracing::debug!(
                                    event = "unannounced_payload",
                                    block_id = %header.block_id,
                                    "Payload without a preceding announcement"
                                );
                            }
                        }
                        self.process_block(header, ciphertext).await?;
                    }
                    Err(_) => {
                        tracing::warn!(event = "block_wire_undecodable", "Dropping binary payload");
                    }
                }
            }
        }
        Ok(())
    }

    /// Verify and journal one block, then acknowledge. Replays of an
    /// already-completed (fileId, seq) re-ACK without touching the row.
    async fn process_block(
        &mut self,
        header: BlockHeader,
        ciphertext: Vec<u8>,
    ) -> Result<(), EngineError> {
        if self.tracker.is_none() {
            self.adopt_file(&header).await?;
        }
        let (file_id, total_seq) = {
            let tracker = self.tracker.as_ref().expect("tracker adopted above");
            (tracker.file_id, tracker.total_seq)
        };

        if header.file_id != file_id {
            tracing::warn!(
                event = "foreign_file_block",
                expected = %file_id,
                got = %header.file_id,
                "Block belongs to a different file, ignoring"
            );
            return Ok(());
        }
        if header.seq >= total_seq {
            tracing::warn!(
                event = "sequence_out_of_range",
                seq = header.seq,
                total = total_seq,
                "Block sequence outside the announced range"
            );
            return Ok(());
        }

        // Idempotent duplicate delivery: the journal already holds the
        // verified row; just re-acknowledge so the sender converges.
        if let Some(row) = self.journal.get_block(file_id, header.seq) {
            if row.state == BlockState::Completed {
                let (block_id, seq) = (row.header.block_id, row.seq);
                self.send_ack(block_id, seq).await;
                return Ok(());
            }
        }

        match open_block(&self.key, &header, &ciphertext) {
            Ok(decoded) => {
                let row = StoredBlock {
                    file_id,
                    seq: header.seq,
                    header: header.clone(),
                    payload: ciphertext,
                    decoded: Some(decoded.clone()),
                    state: BlockState::Completed,
                };
                let journal = &mut self.journal;
                with_journal_retry(|| journal.put_block(row.clone())).await?;

                if let Some(tracker) = self.tracker.as_mut() {
                    if !tracker.bitmap.is_set(header.seq) {
                        tracker.bitmap.set(header.seq);
                        tracker.decoded_bytes += decoded.len() as u64;
                    }
                }
                self.last_progress = Instant::now();

                self.send_ack(header.block_id, header.seq).await;
                emit(&self.events, EngineEvent::BlockCompleted { seq: header.seq });
                self.publish_progress();
            }
            Err(block_error) => {
                self.reject_block(&header, ciphertext, block_error).await?;
            }
        }
        Ok(())
    }

    async fn reject_block(
        &mut self,
        header: &BlockHeader,
        ciphertext: Vec<u8>,
        block_error: BlockError,
    ) -> Result<(), EngineError> {
        tracing::warn!(
            event = "block_verification_failed",
            seq = header.seq,
            block_id = %header.block_id,
            error = %block_error,
            "Block failed verification, requesting retransmit"
        );

        let row = StoredBlock {
            file_id: header.file_id,
            seq: header.seq,
            header: header.clone(),
            payload: ciphertext,
            decoded: None,
            state: BlockState::Failed,
        };
        let journal = &mut self.journal;
        with_journal_retry(|| journal.put_block(row.clone())).await?;

        let reason = NackReason::from(block_error);
        self.retransmit_requests += 1;
        self.send_control(WireMessage::Nack {
            file_id: header.file_id,
            block_id: Some(header.block_id),
            seq: header.seq,
            reason,
        })
        .await;
        emit(
            &self.events,
            EngineEvent::Retransmit {
                seq: header.seq,
                reason,
            },
        );
        Ok(())
    }

    /// First block header seen: adopt the file identity into the session
    /// row and size the tracker.
    async fn adopt_file(&mut self, header: &BlockHeader) -> Result<(), EngineError> {
        self.tracker = Some(FileTracker {
            file_id: header.file_id,
            total_seq: header.total_seq,
            bitmap: SeqBitmap::new(header.total_seq),
            decoded_bytes: 0,
        });
        self.session.file_id = header.file_id;
        self.session.total_blocks = header.total_seq;
        self.session.activate();
        self.persist_session().await?;
        tracing::info!(
            event = "file_adopted",
            file_id = %header.file_id,
            total_seq = header.total_seq,
            "Receiving file"
        );
        // Adopt completed rows already journaled for this file — the
        // resume path after a restart.
        let rows = self.journal.get_blocks_for_file(header.file_id);
        if let Some(tracker) = self.tracker.as_mut() {
            for row in rows {
                if row.state == BlockState::Completed && !tracker.bitmap.is_set(row.seq) {
                    tracker.bitmap.set(row.seq);
                    tracker.decoded_bytes +=
                        row.decoded.as_ref().map(|d| d.len() as u64).unwrap_or(0);
                }
            }
        }
        Ok(())
    }

    async fn accept_manifest(&mut self, manifest: Manifest) -> Result<(), EngineError> {
        tracing::info!(
            event = "manifest_received",
            file_id = %manifest.file_id,
            total_blocks = manifest.total_blocks,
            "Manifest received"
        );
        self.session.filename = manifest.filename.clone();
        self.session.total_size = manifest.total_size;
        if self.tracker.is_none() {
            // Manifest before any block: size the tracker from it.
            self.tracker = Some(FileTracker {
                file_id: manifest.file_id,
                total_seq: manifest.total_blocks,
                bitmap: SeqBitmap::new(manifest.total_blocks),
                decoded_bytes: 0,
            });
            self.session.file_id = manifest.file_id;
            self.session.total_blocks = manifest.total_blocks;
            self.session.activate();
        }
        self.persist_session().await?;
        // The manifest is the sender's last word. If blocks are still
        // missing after one more timeout window, assembly runs (and
        // fails) rather than waiting forever.
        self.manifest_deadline = Some(Instant::now() + self.config.block_timeout);
        self.manifest = Some(manifest);
        Ok(())
    }

    // ── Timeouts / NACK ──────────────────────────────────────────────────

    fn next_deadline(&self) -> Instant {
        let inactivity = self.last_progress + self.config.block_timeout;
        match self.manifest_deadline {
            Some(manifest) => inactivity.min(manifest),
            None => inactivity,
        }
    }

    async fn handle_deadline(&mut self) -> Result<Option<Outcome>, EngineError> {
        self.reassembler.purge_stale(self.config.block_timeout * 4);

        // Sender finished and the grace window passed with blocks still
        // missing; assembly pronounces the failure.
        if self
            .manifest_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
            && !self.transfer_complete()
        {
            return self.assemble().await.map(Some);
        }

        if self.paused {
            return Ok(None);
        }

        // No progress for a full timeout window: ask for the lowest
        // missing sequence.
        if self.last_progress.elapsed() >= self.config.block_timeout {
            self.last_progress = Instant::now();
            let missing = self
                .tracker
                .as_ref()
                .and_then(|t| t.bitmap.lowest_missing().map(|seq| (t.file_id, seq)));
            if let Some((file_id, seq)) = missing {
                tracing::debug!(
                    event = "inactivity_nack",
                    seq = seq,
                    "No progress, requesting retransmit"
                );
                self.retransmit_requests += 1;
                self.send_control(WireMessage::Nack {
                    file_id,
                    block_id: None,
                    seq,
                    reason: NackReason::MissingChunk,
                })
                .await;
            }
        }
        Ok(None)
    }

    // ── Assembly ─────────────────────────────────────────────────────────

    fn transfer_complete(&self) -> bool {
        self.manifest.is_some()
            && self
                .tracker
                .as_ref()
                .is_some_and(|t| t.bitmap.is_complete())
    }

    /// Fetch all journal rows, re-sort by sequence, concatenate the
    /// decoded payloads, and validate the whole-file hash against the
    /// manifest.
    async fn assemble(&mut self) -> Result<Outcome, EngineError> {
        let Some(manifest) = self.manifest.clone() else {
            return Ok(Outcome::Failed("missing_blocks".into()));
        };

        let mut rows = self.journal.get_blocks_for_file(manifest.file_id);
        rows.sort_by_key(|row| row.seq);

        let data = match validate_assembly(&rows, &manifest) {
            Ok(data) => data,
            Err(error) => {
                // Incomplete coverage and hash disagreement both mean the
                // manifest failed to validate.
                tracing::error!(
                    event = "assembly_failed",
                    error = %error,
                    "Manifest validation failed at assembly"
                );
                return Ok(Outcome::Failed("manifest_mismatch".into()));
            }
        };
        let digest = content_hash_hex(&data);

        self.session.complete();
        self.persist_session().await?;
        tracing::info!(
            event = "file_assembled",
            file_id = %manifest.file_id,
            bytes = data.len(),
            "File reassembled and verified"
        );
        emit(
            &self.events,
            EngineEvent::FileReceived {
                manifest,
                data,
                sha256: digest,
            },
        );
        self.publish_progress();

        self.visual.close();
        if let Some(port) = self.binary.as_mut() {
            port.close();
        }
        Ok(Outcome::Assembled)
    }

    // ── Outbound control ─────────────────────────────────────────────────


    async fn send_ack(&mut self, block_id: Uuid, seq: u64) {
        self.send_control(WireMessage::Ack { block_id, seq }).await;
    }

    /// ACKs and NACKs go out on the binary channel when attached,
    /// otherwise as visual frames.
    async fn send_control(&mut self, message: WireMessage) {
        if let Some(port) = self.binary.as_mut() {
            match encode_binary_control(&message) {
                Ok(bytes) => {
                    if port.send_message(&bytes).await.is_ok() {
                        return;
                    }
                    tracing::warn!(event = "binary_send_failed", "Falling back to visual control");
                    self.binary = None;
                }
                Err(_) => return,
            }
        }
        if let Ok(bytes) = message.to_json() {
            if let Err(e) = self.visual.send_frame(&bytes).await {
                tracing::warn!(event = "visual_send_failed", error = %e, "Control frame dropped");
            }
        }
    }

    // ── Pump / commands / progress ───────────────────────────────────────

    async fn pump(&mut self, deadline: Instant) -> Pumped {
        let commands = &mut self.commands;
        let commands_closed = self.commands_closed;
        let visual = &mut self.visual;
        let visual_closed = self.visual_inbound_closed;
        let binary = self.binary.as_mut();

        tokio::select! {
            cmd = commands.recv(), if !commands_closed => match cmd {
                Some(cmd) => Pumped::Command(cmd),
                None => Pumped::CommandsClosed,
            },
            frame = recv_visual(visual, visual_closed) => Pumped::Visual(frame),
            message = recv_binary(binary) => Pumped::Binary(message),
            _ = tokio::time::sleep_until(deadline) => Pumped::Deadline,
        }
    }

    async fn handle_command(&mut self, cmd: EngineCommand) -> Result<(), EngineError> {
        match cmd {
            EngineCommand::Pause => {
                if !self.paused {
                    self.paused = true;
                    self.clock.pause();
                    self.session.pause();
                    self.persist_session().await?;
                    self.publish_progress();
                }
            }
            EngineCommand::Resume => {
                if self.paused {
                    self.paused = false;
                    self.clock.resume();
                    self.session.activate();
                    self.persist_session().await?;
                    self.last_progress = Instant::now();
                    self.publish_progress();
                }
            }
            EngineCommand::Stop => {
                self.stopping = true;
            }
        }
        Ok(())
    }

    async fn persist_session(&mut self) -> Result<(), EngineError> {
        let row = self.session.clone();
        let journal = &mut self.journal;
        with_journal_retry(|| journal.put_session(row.clone())).await
    }

    fn publish_progress(&self) {
        let (completed, total, bytes) = match self.tracker.as_ref() {
            Some(t) => (t.bitmap.count(), t.total_seq, t.decoded_bytes),
            None => (0, 0, 0),
        };
        let elapsed = self.clock.elapsed().as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };
        let remaining = self.session.total_size.saturating_sub(bytes);
        let eta_secs = (bytes_per_sec > 0.0).then(|| remaining as f64 / bytes_per_sec);

        emit(
            &self.events,
            EngineEvent::Progress(TransferProgress {
                state: self.session.state,
                percent: if total > 0 {
                    completed as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
                completed_blocks: completed,
                failed_blocks: 0,
                total_blocks: total,
                retransmits: self.retransmit_requests,
                bytes_per_sec,
                eta_secs,
                fingerprint: self.key.fingerprint(),
            }),
        );
    }
}

/// Concatenate the decoded payloads of sequence-sorted rows and validate
/// the whole-file hash against the manifest.
fn validate_assembly(rows: &[StoredBlock], manifest: &Manifest) -> Result<Vec<u8>, AssemblyError> {
    let mut data = Vec::with_capacity(manifest.total_size as usize);
    let mut present = 0u64;
    for row in rows {
        if row.state == BlockState::Completed {
            if let Some(decoded) = &row.decoded {
                present += 1;
                data.extend_from_slice(decoded);
            }
        }
    }

    if present != manifest.total_blocks {
        return Err(AssemblyError::MissingBlocks {
            expected: manifest.total_blocks,
            missing: manifest.total_blocks - present,
        });
    }
    if content_hash_hex(&data) != manifest.sha256 {
        return Err(AssemblyError::ManifestMismatch);
    }
    Ok(data)
}

/// Journaled `Paused`/`Active` sessions whose key derivative matches a
/// freshly derived key — the candidates for resume after a restart.
pub fn resumable_sessions(journal: &Journal, key: &SessionKey) -> Vec<Session> {
    let fingerprint = key.fingerprint();
    journal
        .get_all_sessions()
        .into_iter()
        .filter(|s| {
            matches!(s.state, SessionState::Paused | SessionState::Active)
                && s.matches_key(&fingerprint)
        })
        .collect()
}

async fn recv_visual(port: &mut Box<dyn VisualPort>, closed: bool) -> Option<Vec<u8>> {
    if closed {
        std::future::pending::<()>().await;
    }
    port.next_frame().await
}

async fn recv_binary(port: Option<&mut Box<dyn BinaryPort>>) -> Option<Vec<u8>> {
    match port {
        Some(port) => port.next_message().await,
        None => std::future::pending().await,
    }
}
