//! Sender pipeline: chunk → seal → journal → dual-channel emission.
//!
//! Blocks are emitted in ascending sequence order, one in flight at a time.
//! Each emission round sends the block over the binary channel (when
//! attached and below its backpressure watermark) and always renders it as
//! visual frames, then waits for an `ack` up to the block timeout. A `nack`
//! or timeout starts another round; exhausting the retransmit budget marks
//! the block `Skipped` and the transfer moves on. The manifest goes out
//! last, win or lose — the receiver's assembly is what pronounces the
//! verdict.
//!
//! The whole pipeline is one cooperative task: inbound control, commands,
//! hold timers, and ack waits all multiplex through a single `select!`
//! pump, so pause/stop are observed at every suspension point.

use crate::block::{
    chunk_count, chunk_span, encode_wire, seal_block, BlockRecord, BlockState, Manifest,
};
use crate::config::EngineConfig;
use crate::crypto::{content_hash_hex, SessionKey};
use crate::engine::{
    emit, encode_binary_control, encode_binary_payload, with_journal_retry, EngineCommand,
    EngineEvent, ProgressClock, TransferProgress, WireMessage,
};
use crate::error::{EngineError, TransportError};
use crate::framing::split_block;
use crate::journal::{Journal, StoredBlock};
use crate::session::{Role, Session};
use crate::transport::{BinaryPort, VisualPort};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Host-side handle to a running sender: commands in, events out.
pub struct SenderHandle {
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub commands: mpsc::UnboundedSender<EngineCommand>,
}

/// What one pump round observed.
enum Pumped {
    Command(EngineCommand),
    CommandsClosed,
    Visual(Option<Vec<u8>>),
    Binary(Option<Vec<u8>>),
    Deadline,
}

/// Outcome of waiting on an acknowledgement for the in-flight block.
enum AckWait {
    Acked,
    Nacked,
    TimedOut,
    Stopped,
}

pub struct Sender {
    config: EngineConfig,
    key: SessionKey,
    session: Session,
    journal: Journal,
    visual: Box<dyn VisualPort>,
    binary: Option<Box<dyn BinaryPort>>,
    records: BTreeMap<u64, BlockRecord>,
    manifest: Manifest,
    events: mpsc::UnboundedSender<EngineEvent>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    clock: ProgressClock,
    paused: bool,
    stopping: bool,
    visual_inbound_closed: bool,
    commands_closed: bool,
    retransmits_total: u64,
    last_heartbeat: Instant,
}

impl Sender {
    /// Prepare a fresh transfer: chunk the file, seal every block, journal
    /// the pending rows, and create the session row.
    pub async fn new(
        key: SessionKey,
        filename: &str,
        data: &[u8],
        mut journal: Journal,
        config: EngineConfig,
        visual: Box<dyn VisualPort>,
        binary: Option<Box<dyn BinaryPort>>,
    ) -> Result<(Self, SenderHandle), EngineError> {
        let file_id = Uuid::new_v4();
        let total = chunk_count(data.len(), config.block_size);

        let mut records = BTreeMap::new();
        for seq in 0..total {
            let (start, end) = chunk_span(seq, data.len(), config.block_size);
            let record = seal_block(&key, file_id, seq, total, &data[start..end])?;
            let row = StoredBlock {
                file_id,
                seq,
                header: record.header.clone(),
                payload: record.payload.clone(),
                decoded: None,
                state: BlockState::Pending,
            };
            with_journal_retry(|| journal.put_block(row.clone())).await?;
            records.insert(seq, record);
        }

        let manifest = Manifest {
            file_id,
            filename: filename.to_string(),
            total_size: data.len() as u64,
            total_blocks: total,
            sha256: content_hash_hex(data),
        };

        let session = Session::new(
            Role::Sender,
            file_id,
            filename.to_string(),
            data.len() as u64,
            total,
            key.fingerprint(),
        );
        with_journal_retry(|| journal.put_session(session.clone())).await?;

        Ok(Self::assemble_parts(
            key, session, journal, config, visual, binary, records, manifest,
        ))
    }

    /// Resume a journaled transfer after a restart. The caller re-runs the
    /// handshake first; `session` must carry the matching key fingerprint.
    /// Sequences already `Completed` in the journal are skipped; the
    /// remaining blocks are re-sent with their original headers and
    /// ciphertext.
    pub async fn resume(
        session: Session,
        key: SessionKey,
        data: &[u8],
        mut journal: Journal,
        config: EngineConfig,
        visual: Box<dyn VisualPort>,
        binary: Option<Box<dyn BinaryPort>>,
    ) -> Result<(Self, SenderHandle), EngineError> {
        if !session.matches_key(&key.fingerprint()) {
            return Err(EngineError::Handshake(
                crate::error::HandshakeError::MismatchedSession,
            ));
        }

        let total = session.total_blocks;
        let mut records = BTreeMap::new();
        for seq in 0..total {
            let record = match journal.get_block(session.file_id, seq) {
                Some(row) => {
                    let mut record = BlockRecord::new(row.header.clone(), row.payload.clone());
                    record.state = row.state;
                    if row.state == BlockState::Completed {
                        record.verified = true;
                    }
                    record
                }
                // A row lost to a partial journal write is rebuilt from the
                // source bytes under a fresh nonce.
                None => {
                    let (start, end) = chunk_span(seq, data.len(), config.block_size);
                    let record = seal_block(&key, session.file_id, seq, total, &data[start..end])?;
                    let row = StoredBlock {
                        file_id: session.file_id,
                        seq,
                        header: record.header.clone(),
                        payload: record.payload.clone(),
                        decoded: None,
                        state: BlockState::Pending,
                    };
                    with_journal_retry(|| journal.put_block(row.clone())).await?;
                    record
                }
            };
            records.insert(seq, record);
        }

        let manifest = Manifest {
            file_id: session.file_id,
            filename: session.filename.clone(),
            total_size: data.len() as u64,
            total_blocks: total,
            sha256: content_hash_hex(data),
        };

        tracing::info!(
            event = "transfer_resumed",
            session_id = %session.session_id,
            completed = records.values().filter(|r| r.state == BlockState::Completed).count(),
            total = total,
            "Resuming journaled transfer"
        );

        Ok(Self::assemble_parts(
            key, session, journal, config, visual, binary, records, manifest,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_parts(
        key: SessionKey,
        session: Session,
        journal: Journal,
        config: EngineConfig,
        visual: Box<dyn VisualPort>,
        binary: Option<Box<dyn BinaryPort>>,
        records: BTreeMap<u64, BlockRecord>,
        manifest: Manifest,
    ) -> (Self, SenderHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let sender = Self {
            config,
            key,
            session,
            journal,
            visual,
            binary,
            records,
            manifest,
            events: events_tx,
            commands: commands_rx,
            clock: ProgressClock::start(),
            paused: false,
            stopping: false,
            visual_inbound_closed: false,
            commands_closed: false,
            retransmits_total: 0,
            last_heartbeat: Instant::now(),
        };
        (
            sender,
            SenderHandle {
                events: events_rx,
                commands: commands_tx,
            },
        )
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drive the transfer to its terminal state. Protocol-level failures
    /// are recorded in the returned session; only infrastructure failures
    /// (journal unavailable, all transports gone) surface as `Err`.
    pub async fn run(mut self) -> Result<Session, EngineError> {
        match self.run_inner().await {
            Ok(()) => Ok(self.session),
            Err(e) => {
                let reason = fail_reason(&e);
                self.session.fail(&reason);
                let row = self.session.clone();
                let _ = self.journal.put_session(row);
                emit(&self.events, EngineEvent::Failed { reason });
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<(), EngineError> {
        self.session.activate();
        self.persist_session().await?;
        self.publish_progress();

        let seqs: Vec<u64> = self.records.keys().copied().collect();
        'blocks: for seq in seqs {
            if self.records[&seq].state == BlockState::Completed {
                continue;
            }

            loop {
                if self.stopping {
                    break 'blocks;
                }
                self.wait_while_paused().await?;
                if self.stopping {
                    break 'blocks;
                }

                let attempts = {
                    let record = self.records.get_mut(&seq).expect("dense sequence range");
                    if record.state == BlockState::Completed {
                        break;
                    }
                    if record.attempts >= self.config.max_retransmits_per_block {
                        record.state = BlockState::Skipped;
                        None
                    } else {
                        record.attempts += 1;
                        record.state = BlockState::Sending;
                        Some(record.attempts)
                    }
                };

                let Some(attempts) = attempts else {
                    self.mark_skipped(seq).await?;
                    break;
                };

                tracing::debug!(
                    event = "block_emission",
                    seq = seq,
                    attempt = attempts,
                    "Emitting block"
                );

                self.emit_block(seq).await?;
                if self.records[&seq].state == BlockState::Completed {
                    break;
                }

                match self.wait_for_ack(seq).await? {
                    AckWait::Acked => break,
                    AckWait::Nacked | AckWait::TimedOut => continue,
                    AckWait::Stopped => break 'blocks,
                }
            }
        }

        self.send_manifest().await;
        self.finish().await
    }

    // ── Emission ─────────────────────────────────────────────────────────

    /// One emission round: binary announcement + payload (backpressure
    /// permitting), then the visual frame loop with per-frame hold times.
    /// Returns early if the ack lands mid-emission.
    async fn emit_block(&mut self, seq: u64) -> Result<(), EngineError> {
        self.maybe_heartbeat().await;

        let (announcement, payload_msg, frames) = {
            let record = &self.records[&seq];
            let wire = encode_wire(&record.header, &record.payload)?;
            let announcement = WireMessage::BlockAnnouncement {
                block_id: record.header.block_id,
                seq,
                size: record.payload.len() as u64,
                checksum: record.header.checksum.clone(),
            };
            let frames = split_block(&record.header, &wire, self.config.effective_frame_budget());
            (announcement, encode_binary_payload(&wire), frames)
        };

        // Binary path: announcement then payload, serialized per channel.
        // A saturated channel skips this round — visual emission continues
        // and the next attempt retries the binary path.
        if let Some(port) = self.binary.as_mut() {
            if port.buffered_amount() <= self.config.binary_watermark {
                let sent = async {
                    port.send_message(&encode_binary_control(&announcement)?).await?;
                    port.send_message(&payload_msg).await?;
                    Ok::<(), EngineError>(())
                }
                .await;
                match sent {
                    Ok(()) => {
                        if let Some(record) = self.records.get_mut(&seq) {
                            record.sent_over_binary = true;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            event = "binary_send_failed",
                            seq = seq,
                            error = %e,
                            "Binary channel lost, continuing visual-only"
                        );
                        self.binary = None;
                    }
                }
            } else {
                tracing::debug!(
                    event = "binary_backpressure",
                    seq = seq,
                    buffered = port.buffered_amount(),
                    "Binary channel saturated, visual only this round"
                );
            }
        }

        // Visual path: always emitted, each frame held on screen long
        // enough for the camera to lock.
        for frame in frames {
            if self.stopping || self.records[&seq].state == BlockState::Completed {
                return Ok(());
            }
            let bytes = WireMessage::Chunk(frame).to_json()?;
            if let Err(e) = self.visual.send_frame(&bytes).await {
                if self.binary.is_none() {
                    return Err(e.into());
                }
                tracing::warn!(
                    event = "visual_send_failed",
                    seq = seq,
                    "Visual channel lost, binary continues"
                );
                return Ok(());
            }
            if let Some(record) = self.records.get_mut(&seq) {
                record.sent_over_visual = true;
            }
            self.hold_frame(seq).await?;
        }

        Ok(())
    }

    /// Sleep out the visual hold time while staying responsive to inbound
    /// control and commands.
    async fn hold_frame(&mut self, seq: u64) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.config.visual_hold;
        loop {
            if self.records[&seq].state == BlockState::Completed || self.stopping {
                return Ok(());
            }
            match self.pump(deadline).await {
                Pumped::Deadline => return Ok(()),
                other => self.handle_pumped(other).await?,
            }
        }
    }

    async fn wait_for_ack(&mut self, seq: u64) -> Result<AckWait, EngineError> {
        let deadline = Instant::now() + self.config.block_timeout;
        loop {
            if self.records[&seq].state == BlockState::Completed {
                return Ok(AckWait::Acked);
            }
            if self.stopping {
                return Ok(AckWait::Stopped);
            }
            let before = self.records[&seq].retransmits;
            match self.pump(deadline).await {
                Pumped::Deadline => return Ok(AckWait::TimedOut),
                other => self.handle_pumped(other).await?,
            }
            if self.records[&seq].state == BlockState::Completed {
                return Ok(AckWait::Acked);
            }
            if self.records[&seq].retransmits > before {
                return Ok(AckWait::Nacked);
            }
        }
    }

    async fn maybe_heartbeat(&mut self) {
        if self.last_heartbeat.elapsed() < self.config.heartbeat_interval {
            return;
        }
        if let Some(port) = self.binary.as_mut() {
            if let Ok(bytes) = encode_binary_control(&WireMessage::Heartbeat) {
                if port.send_message(&bytes).await.is_err() {
                    self.binary = None;
                }
            }
        }
        self.last_heartbeat = Instant::now();
    }

    async fn send_manifest(&mut self) {
        let message = WireMessage::Manifest(self.manifest.clone());
        if let Some(port) = self.binary.as_mut() {
            if let Ok(bytes) = encode_binary_control(&message) {
                if port.send_message(&bytes).await.is_ok() {
                    return;
                }
            }
            self.binary = None;
        }
        if let Ok(bytes) = message.to_json() {
            if let Err(e) = self.visual.send_frame(&bytes).await {
                tracing::warn!(
                    event = "manifest_emit_failed",
                    error = %e,
                    "Could not emit manifest on any channel"
                );
            }
        }
    }

    // ── Pump ─────────────────────────────────────────────────────────────

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

    async fn handle_pumped(&mut self, pumped: Pumped) -> Result<(), EngineError> {
        match pumped {
            Pumped::Command(cmd) => self.handle_command(cmd).await?,
            Pumped::CommandsClosed => self.commands_closed = true,
            Pumped::Visual(None) => {
                self.visual_inbound_closed = true;
            }
            Pumped::Visual(Some(bytes)) => match WireMessage::from_json(&bytes) {
                Ok(message) => self.handle_control(message).await?,
                Err(_) => {
                    tracing::debug!(event = "visual_frame_undecodable", "Dropping unparseable frame");
                }
            },
            Pumped::Binary(None) => {
                tracing::info!(event = "binary_channel_closed", "Binary channel ended");
                self.binary = None;
            }
            Pumped::Binary(Some(bytes)) => match crate::engine::decode_binary(&bytes) {
                Ok(crate::engine::BinaryMessage::Control(message)) => {
                    self.handle_control(message).await?
                }
                Ok(crate::engine::BinaryMessage::Payload(_)) => {
                    tracing::debug!(event = "unexpected_payload", "Sender ignoring inbound payload");
                }
                Err(_) => {
                    tracing::debug!(event = "binary_message_undecodable", "Dropping message");
                }
            },
            Pumped::Deadline => {}
        }
        Ok(())
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
                    self.publish_progress();
                }
            }
            EngineCommand::Stop => {
                self.stopping = true;
            }
        }
        Ok(())
    }

    /// Inbound `ack`/`nack` from either channel. Terminal blocks ignore
    /// late control — duplicate delivery is idempotent by design.
    async fn handle_control(&mut self, message: WireMessage) -> Result<(), EngineError> {
        match message {
            WireMessage::Ack { seq, .. } => {
                let completed = match self.records.get_mut(&seq) {
                    Some(record) if !record.state.is_terminal() => {
                        record.state = BlockState::Completed;
                        record.verified = true;
                        true
                    }
                    _ => false,
                };
                if completed {
                    self.update_block_row(seq, BlockState::Completed).await?;
                    emit(&self.events, EngineEvent::BlockCompleted { seq });
                    self.publish_progress();
                }
            }
            WireMessage::Nack { seq, reason, .. } => {
                match self.records.get_mut(&seq) {
                    Some(record) if !record.state.is_terminal() => {
                        record.retransmits += 1;
                        record.last_error = Some(format!("nack: {reason:?}"));
                        self.retransmits_total += 1;
                        emit(&self.events, EngineEvent::Retransmit { seq, reason });
                    }
                    _ => {
                        tracing::debug!(
                            event = "late_nack_ignored",
                            seq = seq,
                            "NACK for a terminal block"
                        );
                    }
                }
            }
            WireMessage::Heartbeat => {}
            other => {
                tracing::debug!(event = "unexpected_control", ?other, "Sender ignoring message");
            }
        }
        Ok(())
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────

    async fn wait_while_paused(&mut self) -> Result<(), EngineError> {
        while self.paused && !self.stopping {
            let deadline = Instant::now() + self.config.block_timeout;
            let pumped = self.pump(deadline).await;
            self.handle_pumped(pumped).await?;
        }
        Ok(())
    }

    async fn mark_skipped(&mut self, seq: u64) -> Result<(), EngineError> {
        tracing::warn!(
            event = "block_skipped",
            seq = seq,
            attempts = self.config.max_retransmits_per_block,
            "Block exhausted its retransmit budget"
        );
        self.update_block_row(seq, BlockState::Skipped).await?;
        emit(&self.events, EngineEvent::BlockSkipped { seq });
        self.publish_progress();
        Ok(())
    }

    async fn update_block_row(&mut self, seq: u64, state: BlockState) -> Result<(), EngineError> {
        let record = &self.records[&seq];
        let row = StoredBlock {
            file_id: self.session.file_id,
            seq,
            header: record.header.clone(),
            payload: record.payload.clone(),
            decoded: None,
            state,
        };
        let journal = &mut self.journal;
        with_journal_retry(|| journal.put_block(row.clone())).await
    }

    async fn persist_session(&mut self) -> Result<(), EngineError> {
        let row = self.session.clone();
        let journal = &mut self.journal;
        with_journal_retry(|| journal.put_session(row.clone())).await
    }

    async fn finish(&mut self) -> Result<(), EngineError> {
        let all_completed = self
            .records
            .values()
            .all(|r| r.state == BlockState::Completed);

        if self.stopping && !all_completed {
            self.session.fail("stopped");
            emit(&self.events, EngineEvent::Failed { reason: "stopped".into() });
        } else if all_completed {
            self.session.complete();
            emit(
                &self.events,
                EngineEvent::Completed {
                    manifest: self.manifest.clone(),
                },
            );
        } else {
            self.session.fail("missing_blocks");
            emit(
                &self.events,
                EngineEvent::Failed {
                    reason: "missing_blocks".into(),
                },
            );
        }
        self.persist_session().await?;
        self.publish_progress();

        self.visual.close();
        if let Some(port) = self.binary.as_mut() {
            port.close();
        }
        Ok(())
    }

    fn publish_progress(&self) {
        let total = self.session.total_blocks;
        let completed = self
            .records
            .values()
            .filter(|r| r.state == BlockState::Completed)
            .count() as u64;
        let failed = self
            .records
            .values()
            .filter(|r| matches!(r.state, BlockState::Failed | BlockState::Skipped))
            .count() as u64;
        let done_bytes: u64 = self
            .records
            .values()
            .filter(|r| r.state == BlockState::Completed)
            .map(|r| r.header.raw_size)
            .sum();

        let elapsed = self.clock.elapsed().as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            done_bytes as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.session.total_size.saturating_sub(done_bytes);
        let eta_secs = (bytes_per_sec > 0.0).then(|| remaining as f64 / bytes_per_sec);

        emit(
            &self.events,
            EngineEvent::Progress(TransferProgress {
                state: self.session.state,
                percent: if total > 0 {
                    completed as f64 / total as f64 * 100.0
                } else {
                    100.0
                },
                completed_blocks: completed,
                failed_blocks: failed,
                total_blocks: total,
                retransmits: self.retransmits_total,
                bytes_per_sec,
                eta_secs,
                fingerprint: self.key.fingerprint(),
            }),
        );
    }
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

fn fail_reason(error: &EngineError) -> String {
    match error {
        EngineError::JournalUnavailable(_) => "journal_unavailable".to_string(),
        EngineError::Transport(TransportError::VisualClosed) => "transport_closed".to_string(),
        EngineError::Transport(TransportError::BinaryClosed) => "transport_closed".to_string(),
        other => other.to_string(),
    }
}
