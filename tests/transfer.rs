//! End-to-end transfer scenarios over in-memory transports.
//!
//! Each test wires a sender and receiver through the channel-backed ports,
//! optionally with a proxy task in the middle for loss and corruption
//! injection, and drives both pipelines to their terminal sessions.

use opticalsend::block::BlockState;
use opticalsend::engine::WireMessage;
use opticalsend::journal::Journal;
use opticalsend::transport::memory::{binary_pair, visual_pair, MemoryBinary, MemoryVisual};
use opticalsend::transport::{BinaryPort, VisualPort};
use opticalsend::{
    resumable_sessions, EngineCommand, EngineConfig, EngineEvent, HandshakeReceiver,
    HandshakeSender, NackReason, Receiver, RequestedOptions, Sender, SessionState,
};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

fn fast_config() -> EngineConfig {
    EngineConfig {
        visual_hold: Duration::from_millis(2),
        block_timeout: Duration::from_millis(150),
        heartbeat_interval: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}

fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("opticalsend_e2e_{tag}_{}", Uuid::new_v4()))
}

/// Derive a matched key pair through the real two-frame handshake.
fn handshake_keys() -> (
    opticalsend::crypto::SessionKey,
    opticalsend::crypto::SessionKey,
    Uuid,
) {
    let session_id = Uuid::new_v4();
    let mut sender = HandshakeSender::new(session_id);
    let offer = sender.initiate();
    let mut receiver = HandshakeReceiver::new();
    let response = receiver
        .respond(
            &offer,
            RequestedOptions {
                block_size: 1024,
                prefer_compression: true,
            },
        )
        .unwrap();
    let sender_key = sender.finalize(&response.frame).unwrap();
    (sender_key, response.session_key, session_id)
}

/// Pseudo-random but deterministic test payload.
fn patterned_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Bidirectional visual proxy; `forward` filters sender→receiver frames.
async fn visual_proxy<F>(mut a: MemoryVisual, mut b: MemoryVisual, mut forward: F)
where
    F: FnMut(Vec<u8>) -> Option<Vec<u8>> + Send,
{
    let mut a_open = true;
    let mut b_open = true;
    while a_open || b_open {
        tokio::select! {
            frame = a.next_frame(), if a_open => match frame {
                Some(frame) => {
                    if let Some(frame) = forward(frame) {
                        let _ = b.send_frame(&frame).await;
                    }
                }
                None => {
                    a_open = false;
                    b.close();
                }
            },
            frame = b.next_frame(), if b_open => match frame {
                Some(frame) => {
                    let _ = a.send_frame(&frame).await;
                }
                None => {
                    b_open = false;
                    a.close();
                }
            },
        }
    }
}

/// Bidirectional binary proxy; `forward` filters sender→receiver messages.
async fn binary_proxy<F>(mut a: MemoryBinary, mut b: MemoryBinary, mut forward: F)
where
    F: FnMut(Vec<u8>) -> Option<Vec<u8>> + Send,
{
    let mut a_open = true;
    let mut b_open = true;
    while a_open || b_open {
        tokio::select! {
            message = a.next_message(), if a_open => match message {
                Some(message) => {
                    if let Some(message) = forward(message) {
                        let _ = b.send_message(&message).await;
                    }
                }
                None => {
                    a_open = false;
                    b.close();
                }
            },
            message = b.next_message(), if b_open => match message {
                Some(message) => {
                    let _ = a.send_message(&message).await;
                }
                None => {
                    b_open = false;
                    a.close();
                }
            },
        }
    }
}

fn drain_events(events: &mut tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

fn received_file(events: &[EngineEvent]) -> Option<(Vec<u8>, String)> {
    events.iter().find_map(|event| match event {
        EngineEvent::FileReceived { data, sha256, .. } => Some((data.clone(), sha256.clone())),
        _ => None,
    })
}

// ── Scenario 1: single-block happy path, visual only ─────────────────────────

#[tokio::test]
async fn single_block_happy_path_over_visual_channel() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    let (sv, rv) = visual_pair();
    let (sender, _sh) = Sender::new(
        sender_key,
        "eight.bin",
        &data,
        Journal::open(temp_root("happy_s")).unwrap(),
        fast_config(),
        Box::new(sv),
        None,
    )
    .await
    .unwrap();
    assert_eq!(sender.session().total_blocks, 1);

    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("happy_r")).unwrap(),
        fast_config(),
        Box::new(rv),
        None,
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();

    assert_eq!(sender_session.state, SessionState::Completed);
    assert_eq!(receiver_session.state, SessionState::Completed);

    let events = drain_events(&mut rh.events);
    let (received, sha256) = received_file(&events).expect("file delivered");
    assert_eq!(received, data);
    assert_eq!(sha256, opticalsend::crypto::content_hash_hex(&data));
}

// ── Scenario 2: out-of-order arrival assembles correctly ─────────────────────

#[tokio::test]
async fn out_of_order_blocks_assemble_to_original() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = patterned_bytes(3000, 77);
    let config = fast_config();

    // Seal the three blocks directly and inject them in order [2, 0, 1].
    use opticalsend::block::{chunk_count, chunk_span, encode_wire, seal_block};
    use opticalsend::framing::split_block;

    let file_id = Uuid::new_v4();
    let total = chunk_count(data.len(), config.block_size);
    assert_eq!(total, 3);

    let (mut test_side, receiver_side) = visual_pair();
    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("ooo_r")).unwrap(),
        config.clone(),
        Box::new(receiver_side),
        None,
    )
    .await
    .unwrap();
    let receiver_task = tokio::spawn(receiver.run());

    let manifest = opticalsend::Manifest {
        file_id,
        filename: "ooo.bin".into(),
        total_size: data.len() as u64,
        total_blocks: total,
        sha256: opticalsend::crypto::content_hash_hex(&data),
    };

    for seq in [2u64, 0, 1] {
        let (start, end) = chunk_span(seq, data.len(), config.block_size);
        let record = seal_block(&sender_key, file_id, seq, total, &data[start..end]).unwrap();
        let wire = encode_wire(&record.header, &record.payload).unwrap();
        for frame in split_block(&record.header, &wire, config.effective_frame_budget()) {
            let bytes = WireMessage::Chunk(frame).to_json().unwrap();
            test_side.send_frame(&bytes).await.unwrap();
        }
    }
    let manifest_bytes = WireMessage::Manifest(manifest.clone()).to_json().unwrap();
    test_side.send_frame(&manifest_bytes).await.unwrap();

    let receiver_session = receiver_task.await.unwrap().unwrap();
    assert_eq!(receiver_session.state, SessionState::Completed);

    let events = drain_events(&mut rh.events);
    let (received, sha256) = received_file(&events).expect("file delivered");
    assert_eq!(received, data);
    assert_eq!(sha256, manifest.sha256);
}

// ── Scenario 3: corrupted ciphertext triggers NACK and retransmit ────────────

#[tokio::test]
async fn corrupted_binary_payload_is_nacked_and_retransmitted() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = patterned_bytes(900, 13);
    let mut config = fast_config();
    // Slow the visual path so the corrupted binary copy arrives first.
    config.visual_hold = Duration::from_millis(40);

    let (sv, rv) = visual_pair();
    let (sb, proxy_s) = binary_pair();
    let (rb, proxy_r) = binary_pair();

    // Corrupt bit 0 of the first binary block payload only.
    let mut corrupted_once = false;
    tokio::spawn(binary_proxy(proxy_s, proxy_r, move |mut message| {
        if !corrupted_once && message.first() == Some(&0x02) && message.len() > 10 {
            corrupted_once = true;
            let idx = message.len() - 1;
            message[idx] ^= 0x01;
        }
        Some(message)
    }));

    let (sender, _sh) = Sender::new(
        sender_key,
        "nacked.bin",
        &data,
        Journal::open(temp_root("nack_s")).unwrap(),
        config.clone(),
        Box::new(sv),
        Some(Box::new(sb)),
    )
    .await
    .unwrap();

    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("nack_r")).unwrap(),
        config,
        Box::new(rv),
        Some(Box::new(rb)),
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();

    assert_eq!(sender_session.state, SessionState::Completed);
    assert_eq!(receiver_session.state, SessionState::Completed);

    let events = drain_events(&mut rh.events);
    assert!(
        events.iter().any(|event| matches!(
            event,
            EngineEvent::Retransmit { reason: NackReason::DecryptFailed, .. }
        )),
        "expected a decrypt_failed NACK"
    );
    let (received, _) = received_file(&events).expect("file delivered");
    assert_eq!(received, data);
}

// ── Scenario 6: resume after restart ─────────────────────────────────────────

#[tokio::test]
async fn resume_after_restart_continues_at_first_incomplete_sequence() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = patterned_bytes(10 * 1024, 5);
    let config = fast_config();
    let root_s = temp_root("resume_s");
    let root_r = temp_root("resume_r");

    // First run: blocks sealed and journaled, then the process "crashes".
    let file_id;
    let session;
    {
        let (sv, _rv) = visual_pair();
        let (sender, _sh) = Sender::new(
            sender_key.clone(),
            "resume.bin",
            &data,
            Journal::open(&root_s).unwrap(),
            config.clone(),
            Box::new(sv),
            None,
        )
        .await
        .unwrap();
        session = sender.session().clone();
        file_id = session.file_id;
        assert_eq!(session.total_blocks, 10);
        // Dropped here: the crash.
    }

    // Simulate the pre-crash progress: blocks 0..=6 delivered and verified
    // on both ends.
    let mut journal_s = Journal::open(&root_s).unwrap();
    let mut journal_r = Journal::open(&root_r).unwrap();
    for seq in 0..=6u64 {
        let mut row = journal_s.get_block(file_id, seq).unwrap().clone();
        row.state = BlockState::Completed;
        journal_s.put_block(row.clone()).unwrap();

        use opticalsend::block::chunk_span;
        let (start, end) = chunk_span(seq, data.len(), config.block_size);
        row.decoded = Some(data[start..end].to_vec());
        journal_r.put_block(row).unwrap();
    }
    let mut active_session = session.clone();
    active_session.activate();
    journal_s.put_session(active_session).unwrap();

    // Restart: the freshly derived key's fingerprint matches the persisted
    // session, so its journaled progress is adopted.
    let candidates = resumable_sessions(&journal_s, &sender_key);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].session_id, session.session_id);

    let (sv, rv) = visual_pair();
    let (sender, mut sh) = Sender::resume(
        candidates[0].clone(),
        sender_key,
        &data,
        journal_s,
        config.clone(),
        Box::new(sv),
        None,
    )
    .await
    .unwrap();

    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        journal_r,
        config,
        Box::new(rv),
        None,
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();

    assert_eq!(sender_session.state, SessionState::Completed);
    assert_eq!(receiver_session.state, SessionState::Completed);

    // Only sequences 7..=9 were emitted this run.
    let sender_events = drain_events(&mut sh.events);
    let completed: Vec<u64> = sender_events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::BlockCompleted { seq } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![7, 8, 9]);

    let events = drain_events(&mut rh.events);
    let (received, _) = received_file(&events).expect("file delivered");
    assert_eq!(received, data);
}

// ── Dropped block: skipped after the retransmit cap, manifest fails ──────────

#[tokio::test]
async fn dropped_block_is_skipped_and_assembly_reports_mismatch() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = patterned_bytes(3000, 42);
    let config = fast_config();

    let (sv, proxy_s) = visual_pair();
    let (rv, proxy_r) = visual_pair();

    // Drop every frame of block seq=1; count its emission rounds by
    // counting chunkIndex 0 occurrences.
    let (rounds_tx, mut rounds_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(visual_proxy(proxy_s, proxy_r, move |frame| {
        let value: serde_json::Value = serde_json::from_slice(&frame).ok()?;
        if value["type"] == "chunk" && value["seq"] == 1 {
            if value["chunkIndex"] == 0 {
                let _ = rounds_tx.send(());
            }
            return None;
        }
        Some(frame)
    }));

    let (sender, mut sh) = Sender::new(
        sender_key,
        "dropped.bin",
        &data,
        Journal::open(temp_root("drop_s")).unwrap(),
        config.clone(),
        Box::new(sv),
        None,
    )
    .await
    .unwrap();

    let (receiver, _rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("drop_r")).unwrap(),
        config.clone(),
        Box::new(rv),
        None,
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();

    assert_eq!(sender_session.state, SessionState::Failed);
    assert_eq!(sender_session.error_reason.as_deref(), Some("missing_blocks"));
    assert_eq!(receiver_session.state, SessionState::Failed);
    assert_eq!(
        receiver_session.error_reason.as_deref(),
        Some("manifest_mismatch")
    );

    let sender_events = drain_events(&mut sh.events);
    assert!(sender_events
        .iter()
        .any(|event| matches!(event, EngineEvent::BlockSkipped { seq: 1 })));

    // Exactly max_retransmits_per_block emission rounds for the dropped
    // block.
    let mut rounds = 0;
    while rounds_rx.try_recv().is_ok() {
        rounds += 1;
    }
    assert_eq!(rounds, config.max_retransmits_per_block);
}

// ── Dual-channel ordering and backpressure ───────────────────────────────────

#[tokio::test]
async fn binary_payloads_follow_their_announcements() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = patterned_bytes(2500, 99);
    let config = fast_config();

    let (sv, rv) = visual_pair();
    let (sb, proxy_s) = binary_pair();
    let (rb, proxy_r) = binary_pair();

    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(binary_proxy(proxy_s, proxy_r, move |message| {
        let kind = match message.first() {
            Some(&0x01) => {
                let value: serde_json::Value =
                    serde_json::from_slice(&message[1..]).unwrap_or_default();
                value["type"].as_str().unwrap_or("unknown").to_string()
            }
            Some(&0x02) => "payload".to_string(),
            _ => "garbage".to_string(),
        };
        let _ = order_tx.send(kind);
        Some(message)
    }));

    let (sender, _sh) = Sender::new(
        sender_key,
        "ordered.bin",
        &data,
        Journal::open(temp_root("order_s")).unwrap(),
        config.clone(),
        Box::new(sv),
        Some(Box::new(sb)),
    )
    .await
    .unwrap();

    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("order_r")).unwrap(),
        config,
        Box::new(rv),
        Some(Box::new(rb)),
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();
    assert_eq!(sender_session.state, SessionState::Completed);
    assert_eq!(receiver_session.state, SessionState::Completed);

    // Every payload is immediately preceded by a block-announcement.
    let mut order = Vec::new();
    while let Ok(kind) = order_rx.try_recv() {
        order.push(kind);
    }
    for (i, kind) in order.iter().enumerate() {
        if kind == "payload" {
            assert_eq!(
                order[i - 1],
                "block-announcement",
                "payload at {i} not preceded by its announcement: {order:?}"
            );
        }
    }
    assert!(order.iter().any(|k| k == "payload"));

    let events = drain_events(&mut rh.events);
    let (received, _) = received_file(&events).expect("file delivered");
    assert_eq!(received, data);
}

#[tokio::test]
async fn saturated_binary_channel_falls_back_to_visual() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = patterned_bytes(2000, 3);
    let config = fast_config();

    let (sv, rv) = visual_pair();
    let (sb, proxy_s) = binary_pair();
    let (rb, proxy_r) = binary_pair();

    // Saturate the sender-side channel permanently.
    sb.backpressure_handle()
        .store(config.binary_watermark + 1, std::sync::atomic::Ordering::Relaxed);

    let (payload_tx, mut payload_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(binary_proxy(proxy_s, proxy_r, move |message| {
        if message.first() == Some(&0x02) {
            let _ = payload_tx.send(());
        }
        Some(message)
    }));

    let (sender, _sh) = Sender::new(
        sender_key,
        "saturated.bin",
        &data,
        Journal::open(temp_root("sat_s")).unwrap(),
        config.clone(),
        Box::new(sv),
        Some(Box::new(sb)),
    )
    .await
    .unwrap();

    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("sat_r")).unwrap(),
        config,
        Box::new(rv),
        Some(Box::new(rb)),
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();

    assert_eq!(sender_session.state, SessionState::Completed);
    assert_eq!(receiver_session.state, SessionState::Completed);

    // The saturated channel never carried a block payload.
    assert!(payload_rx.try_recv().is_err());

    let events = drain_events(&mut rh.events);
    let (received, _) = received_file(&events).expect("file delivered");
    assert_eq!(received, data);
}

// ── Pause / resume commands ──────────────────────────────────────────────────

#[tokio::test]
async fn pause_and_resume_mid_transfer() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data = patterned_bytes(8 * 1024, 21);
    let config = fast_config();

    let (sv, rv) = visual_pair();
    let (sender, mut sh) = Sender::new(
        sender_key,
        "paused.bin",
        &data,
        Journal::open(temp_root("pause_s")).unwrap(),
        config.clone(),
        Box::new(sv),
        None,
    )
    .await
    .unwrap();

    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("pause_r")).unwrap(),
        config,
        Box::new(rv),
        None,
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let commands = sh.commands.clone();

    // Pause after the first completed block, resume once the pause is
    // visible in a progress event.
    let steer = tokio::spawn(async move {
        let mut saw_paused = false;
        let mut paused_sent = false;
        while let Some(event) = sh.events.recv().await {
            match event {
                EngineEvent::BlockCompleted { .. } if !paused_sent => {
                    paused_sent = true;
                    let _ = commands.send(EngineCommand::Pause);
                }
                EngineEvent::Progress(progress)
                    if paused_sent && !saw_paused && progress.state == SessionState::Paused =>
                {
                    saw_paused = true;
                    let _ = commands.send(EngineCommand::Resume);
                }
                _ => {}
            }
        }
        saw_paused
    });

    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();
    assert_eq!(sender_session.state, SessionState::Completed);
    assert_eq!(receiver_session.state, SessionState::Completed);
    assert!(steer.await.unwrap(), "pause was never observed");

    let events = drain_events(&mut rh.events);
    let (received, _) = received_file(&events).expect("file delivered");
    assert_eq!(received, data);
}

// ── Handshake over the wire ──────────────────────────────────────────────────

#[tokio::test]
async fn handshake_over_visual_channel_derives_matching_keys() {
    let (mut sv, mut rv) = visual_pair();
    let session_id = Uuid::new_v4();

    let receiver_half = tokio::spawn(async move {
        opticalsend::handshake_over_visual_receiver(
            &mut rv,
            RequestedOptions {
                block_size: 1024,
                prefer_compression: true,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    });

    let sender_key =
        opticalsend::handshake_over_visual_sender(&mut sv, session_id, Duration::from_secs(5))
            .await
            .unwrap();
    let response = receiver_half.await.unwrap();

    assert_eq!(sender_key.as_bytes(), response.session_key.as_bytes());
    assert_eq!(response.session_id, session_id);
}

#[tokio::test]
async fn handshake_times_out_without_a_peer() {
    let (mut sv, _rv) = visual_pair();
    let result = opticalsend::handshake_over_visual_sender(
        &mut sv,
        Uuid::new_v4(),
        Duration::from_millis(50),
    )
    .await;
    assert!(matches!(
        result,
        Err(opticalsend::HandshakeError::Timeout)
    ));
}

// ── Boundary: zero-byte file ─────────────────────────────────────────────────

#[tokio::test]
async fn zero_byte_file_transfers_as_single_empty_block() {
    let (sender_key, receiver_key, session_id) = handshake_keys();
    let data: Vec<u8> = Vec::new();

    let (sv, rv) = visual_pair();
    let (sender, _sh) = Sender::new(
        sender_key,
        "empty.bin",
        &data,
        Journal::open(temp_root("zero_s")).unwrap(),
        fast_config(),
        Box::new(sv),
        None,
    )
    .await
    .unwrap();
    assert_eq!(sender.session().total_blocks, 1);

    let (receiver, mut rh) = Receiver::new(
        session_id,
        receiver_key,
        Journal::open(temp_root("zero_r")).unwrap(),
        fast_config(),
        Box::new(rv),
        None,
    )
    .await
    .unwrap();

    let receiver_task = tokio::spawn(receiver.run());
    let sender_session = sender.run().await.unwrap();
    let receiver_session = receiver_task.await.unwrap().unwrap();

    assert_eq!(sender_session.state, SessionState::Completed);
    assert_eq!(receiver_session.state, SessionState::Completed);

    let events = drain_events(&mut rh.events);
    let (received, sha256) = received_file(&events).expect("file delivered");
    assert!(received.is_empty());
    assert_eq!(sha256, opticalsend::crypto::content_hash_hex(&[]));
}
