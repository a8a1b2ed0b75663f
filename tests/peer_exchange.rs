//! End-to-end exchange between two live peers over an in-memory channel:
//! handshake, commitment exchange, chunked transfer with resume, signed
//! keepalive, and a retention challenge against the delivered backup.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use backup_peer::store::{ChunkStateRecord, TransferState};
use backup_peer::transport::{PeerSession, SessionShared};
use backup_peer::{
    event_channel, prepare_backup, send_backup, BackupStatus, ChannelMessage, Direction,
    PeerConfig, PeerContext, PeerEvent,
};

struct Peer {
    ctx: PeerContext,
    session: PeerSession,
    events: mpsc::Receiver<PeerEvent>,
    _home: tempfile::TempDir,
}

impl Peer {
    fn shared(&self) -> &Arc<SessionShared> {
        &self.session.shared
    }
}

/// Two connected peers with commitments exchanged and secrets derived.
async fn connect_pair(chunk_size: u32, keepalive_secs: u64) -> (Peer, Peer) {
    let make_ctx = |keepalive_secs| {
        let home = tempfile::tempdir().unwrap();
        let mut config = PeerConfig::default();
        config.home_dir = home.path().to_path_buf();
        config.chunk_size = chunk_size;
        config.keepalive_secs = keepalive_secs;
        let (events, rx) = event_channel(512);
        let ctx = PeerContext::initialize(config, events).unwrap();
        (ctx, rx, home)
    };
    let (ctx_a, events_a, home_a) = make_ctx(keepalive_secs);
    let (ctx_b, events_b, home_b) = make_ctx(keepalive_secs);

    let (stream_a, stream_b) = tokio::io::duplex(1024 * 1024);
    let (session_a, session_b) = tokio::join!(
        PeerSession::establish(ctx_a.clone(), Box::new(stream_a), None, None),
        PeerSession::establish(ctx_b.clone(), Box::new(stream_b), None, None),
    );
    let session_a = session_a.unwrap();
    let session_b = session_b.unwrap();

    // Commitments cross asynchronously; wait until both secrets exist.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if session_a.shared.shared_secret().is_some()
                && session_b.shared.shared_secret().is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("commitment exchange");

    (
        Peer {
            ctx: ctx_a,
            session: session_a,
            events: events_a,
            _home: home_a,
        },
        Peer {
            ctx: ctx_b,
            session: session_b,
            events: events_b,
            _home: home_b,
        },
    )
}

fn write_source_file(ctx: &PeerContext, backup_id: &str, name: &str, data: &[u8]) {
    let root = ctx.config.backups_dir().join(backup_id);
    let path = root.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::File::create(&path).unwrap().write_all(data).unwrap();
}

async fn drain_until_finished(events: &mut mpsc::Receiver<PeerEvent>) -> Vec<PeerEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            let done = matches!(event, PeerEvent::TransferFinished { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("transfer should finish");
    seen
}

#[tokio::test]
async fn test_single_file_transfer_end_to_end() {
    let (mut a, b) = connect_pair(64 * 1024, 3600).await;

    // 160 KiB: two full chunks and one 32 KiB remainder.
    let data: Vec<u8> = (0..160 * 1024u32).map(|i| (i % 251) as u8).collect();
    write_source_file(&a.ctx, "b1", "docs/report.bin", &data);

    // Give-to-get headroom: we already hold plenty for this peer.
    a.ctx
        .ledger
        .record_offered(b.ctx.keys.peer_id_hash(), 1 << 30, None);

    let root = a.ctx.config.backups_dir().join("b1");
    let backup = prepare_backup(
        &a.ctx,
        "b1",
        "nightly documents",
        b.ctx.keys.peer_id_hash(),
        &root,
        &["docs/report.bin".to_string()],
    )
    .unwrap();
    assert_eq!(backup.file_count, 1);
    assert_eq!(backup.total_bytes, 160 * 1024);
    assert_eq!(backup.metadata.files[0].chunk_count(64 * 1024), 3);

    send_backup(a.shared(), "b1", &root).await.unwrap();

    // Sender side: backup completed, all chunks settled.
    let sent = a.ctx.store.get_backup("b1").unwrap().unwrap();
    assert_eq!(sent.status, BackupStatus::Completed);
    assert!(a.ctx.store.incomplete_chunks("b1").unwrap().is_empty());

    let events = drain_until_finished(&mut a.events).await;
    let progress: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|e| match e {
            PeerEvent::TransferProgress {
                chunks_done,
                chunks_total,
                ..
            } => Some((*chunks_done, *chunks_total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
    assert!(matches!(
        events.last(),
        Some(PeerEvent::TransferFinished {
            succeeded: true,
            ..
        })
    ));

    // Receiver side: identical bytes, completed record, ledger credited.
    let delivered = b.ctx.config.received_dir().join("b1/docs/report.bin");
    assert_eq!(std::fs::read(&delivered).unwrap(), data);

    let received = b.ctx.store.get_backup("b1").unwrap().unwrap();
    assert_eq!(received.direction, Direction::Received);
    assert_eq!(received.status, BackupStatus::Completed);
    assert_eq!(received.file_count, 1);

    let (offered, _) = b.ctx.ledger.totals();
    assert_eq!(offered, 160 * 1024);

    // Consumed side moved on the sender.
    let (_, consumed) = a.ctx.ledger.totals();
    assert_eq!(consumed, 160 * 1024);
}

#[tokio::test]
async fn test_empty_file_and_odd_sizes() {
    let (mut a, b) = connect_pair(1024, 3600).await;
    a.ctx
        .ledger
        .record_offered(b.ctx.keys.peer_id_hash(), 1 << 30, None);

    // Zero bytes, exactly one chunk, and a trailing partial chunk.
    let empty: Vec<u8> = Vec::new();
    let exact: Vec<u8> = vec![7u8; 1024];
    let odd: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
    write_source_file(&a.ctx, "b2", "empty.bin", &empty);
    write_source_file(&a.ctx, "b2", "exact.bin", &exact);
    write_source_file(&a.ctx, "b2", "odd.bin", &odd);

    let root = a.ctx.config.backups_dir().join("b2");
    prepare_backup(
        &a.ctx,
        "b2",
        "edges",
        b.ctx.keys.peer_id_hash(),
        &root,
        &[
            "empty.bin".to_string(),
            "exact.bin".to_string(),
            "odd.bin".to_string(),
        ],
    )
    .unwrap();

    send_backup(a.shared(), "b2", &root).await.unwrap();
    drain_until_finished(&mut a.events).await;

    let base = b.ctx.config.received_dir().join("b2");
    assert_eq!(std::fs::read(base.join("empty.bin")).unwrap(), empty);
    assert_eq!(std::fs::read(base.join("exact.bin")).unwrap(), exact);
    assert_eq!(std::fs::read(base.join("odd.bin")).unwrap(), odd);
}

#[tokio::test]
async fn test_resume_sends_only_missing_chunks() {
    let (mut a, b) = connect_pair(1024, 3600).await;
    a.ctx
        .ledger
        .record_offered(b.ctx.keys.peer_id_hash(), 1 << 30, None);

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
    write_source_file(&a.ctx, "b3", "data.bin", &data);
    let root = a.ctx.config.backups_dir().join("b3");
    prepare_backup(
        &a.ctx,
        "b3",
        "resumable",
        b.ctx.keys.peer_id_hash(),
        &root,
        &["data.bin".to_string()],
    )
    .unwrap();

    // Simulate a crash after chunks 0..2 landed: the sender's states say
    // completed, and the receiver still has the staged chunk files.
    let states = a.ctx.store.chunk_states("b3").unwrap();
    assert_eq!(states.len(), 5);
    for state in states.iter().take(3) {
        a.ctx
            .store
            .upsert_chunk_state(&ChunkStateRecord {
                state: TransferState::Completed,
                attempt_count: 1,
                ..state.clone()
            })
            .unwrap();
    }
    let incomplete: Vec<u32> = a
        .ctx
        .store
        .incomplete_chunks("b3")
        .unwrap()
        .iter()
        .map(|c| c.chunk_index)
        .collect();
    assert_eq!(incomplete, vec![3, 4]);

    let stage = {
        let mut hasher = Sha256::new();
        hasher.update(b"b3:data.bin");
        hex::encode(hasher.finalize())[..24].to_string()
    };
    let stage_dir = b.ctx.config.chunks_dir().join(stage);
    std::fs::create_dir_all(&stage_dir).unwrap();
    for index in 0..3usize {
        let chunk = &data[index * 1024..(index + 1) * 1024];
        std::fs::write(stage_dir.join(format!("{index}.chunk")), chunk).unwrap();
    }

    send_backup(a.shared(), "b3", &root).await.unwrap();

    let events = drain_until_finished(&mut a.events).await;
    let resent = events
        .iter()
        .filter(|e| matches!(e, PeerEvent::TransferProgress { .. }))
        .count();
    assert_eq!(resent, 2, "exactly the two missing chunks travel");

    let delivered = b.ctx.config.received_dir().join("b3/data.bin");
    assert_eq!(std::fs::read(&delivered).unwrap(), data);
    assert!(a.ctx.store.incomplete_chunks("b3").unwrap().is_empty());
}

#[tokio::test]
async fn test_keepalive_roundtrip_records_uptime() {
    let (a, b) = connect_pair(64 * 1024, 1).await;

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let observed = a
                .ctx
                .reputation
                .snapshot(b.ctx.keys.peer_id_hash())
                .map(|r| !r.uptime_window.is_empty())
                .unwrap_or(false);
            if observed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("pong should feed uptime");

    let rep = a.ctx.reputation.snapshot(b.ctx.keys.peer_id_hash()).unwrap();
    assert!(rep.uptime_window.iter().all(|up| *up));
    assert!(a.session.is_connected());
    assert!(b.session.is_connected());
}

#[tokio::test]
async fn test_random_blocks_challenge_over_live_session() {
    let (mut a, b) = connect_pair(1024, 3600).await;
    a.ctx
        .ledger
        .record_offered(b.ctx.keys.peer_id_hash(), 1 << 30, None);

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 239) as u8).collect();
    write_source_file(&a.ctx, "b4", "vault.bin", &data);
    let root = a.ctx.config.backups_dir().join("b4");
    let backup = prepare_backup(
        &a.ctx,
        "b4",
        "challenged",
        b.ctx.keys.peer_id_hash(),
        &root,
        &["vault.bin".to_string()],
    )
    .unwrap();
    send_backup(a.shared(), "b4", &root).await.unwrap();
    drain_until_finished(&mut a.events).await;

    let peer_b = b.ctx.keys.peer_id_hash().to_string();
    let challenge = a.ctx.verifier.issue(&peer_b, &backup, "random_blocks").unwrap();
    a.shared()
        .writer
        .send(&ChannelMessage::StorageChallenge { challenge })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(PeerEvent::VerificationResult {
                succeeded,
                backup_id,
                ..
            }) = a.events.recv().await
            {
                break (succeeded, backup_id);
            }
        }
    })
    .await
    .expect("challenge should settle");

    assert_eq!(result, (true, "b4".to_string()));
    let rep = a.ctx.reputation.snapshot(&peer_b).unwrap();
    assert_eq!(rep.successful_challenges, 1);
    assert_eq!(rep.total_challenges, 1);
    assert!(a.ctx.verifier.history(&peer_b)[0].success);
}

#[tokio::test]
async fn test_corrupted_chunk_never_acked_as_received() {
    let (a, b) = connect_pair(1024, 3600).await;

    // Bypass the sender and push a chunk whose hash lies.
    let key = a.shared().shared_secret().unwrap();
    let sealed = backup_peer::crypto::seal(&key, b"actual payload").unwrap();
    use base64::Engine as _;

    a.shared()
        .writer
        .send(&ChannelMessage::BackupStart {
            backup_id: "bx".into(),
            name: "hostile".into(),
            file_count: 1,
            total_bytes: 14,
        })
        .await
        .unwrap();
    a.shared()
        .writer
        .send(&ChannelMessage::FileStart {
            transfer_id: "bx:f".into(),
            file_name: "f".into(),
            file_size: 14,
            total_chunks: 1,
            chunk_size: 1024,
            file_hash: "00".repeat(32),
            resume_from_chunk: 0,
        })
        .await
        .unwrap();
    a.shared()
        .writer
        .send(&ChannelMessage::FileChunk {
            transfer_id: "bx:f".into(),
            chunk_index: 0,
            chunk_size: 14,
            payload: base64::engine::general_purpose::STANDARD.encode(&sealed),
            chunk_hash: "ff".repeat(32),
        })
        .await
        .unwrap();

    // The receiver must refuse the chunk, so the file can never finalize.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.shared().incoming.open_files(), 1);
    let received = b.ctx.config.received_dir().join("bx");
    assert!(!received.join("f").exists());
}

#[tokio::test]
async fn test_broker_matchmaking_over_tcp() {
    use backup_peer::transport::{MemorySignaling, SignalingEvent, SignalingRequest};

    let make_ctx = || {
        let home = tempfile::tempdir().unwrap();
        let mut config = PeerConfig::default();
        config.home_dir = home.path().to_path_buf();
        let ctx = PeerContext::initialize(config, backup_peer::EventSender::disconnected()).unwrap();
        (ctx, home)
    };
    let (ctx_host, _home_h) = make_ctx();
    let (ctx_req, _home_r) = make_ctx();
    let host_hash = ctx_host.keys.peer_id_hash().to_string();
    let req_hash = ctx_req.keys.peer_id_hash().to_string();

    let (mut sig_host, mut host_requests, host_events) = MemorySignaling::new();
    let (mut sig_req, mut req_requests, req_events) = MemorySignaling::new();

    // A minimal broker: introduce the two peers and relay offer/answer.
    let broker = {
        let host_hash = host_hash.clone();
        let req_hash = req_hash.clone();
        async move {
            // Host advertises a slot.
            assert!(matches!(
                host_requests.recv().await,
                Some(SignalingRequest::HostSlot { .. })
            ));
            // Requester targets it.
            assert!(matches!(
                req_requests.recv().await,
                Some(SignalingRequest::ConnectToPeer { .. })
            ));
            host_events
                .send(SignalingEvent::ConnectionRequest {
                    requester_peer_id: req_hash.clone(),
                    requirements: None,
                })
                .await
                .unwrap();
            assert!(matches!(
                host_requests.recv().await,
                Some(SignalingRequest::AcceptConnection { accept: true, .. })
            ));

            use backup_peer::transport::MatchRole;
            host_events
                .send(SignalingEvent::PeerMatched {
                    peer_id: req_hash.clone(),
                    socket_id: "s-1".into(),
                    role: MatchRole::Host,
                })
                .await
                .unwrap();
            req_events
                .send(SignalingEvent::PeerMatched {
                    peer_id: host_hash.clone(),
                    socket_id: "s-2".into(),
                    role: MatchRole::Requester,
                })
                .await
                .unwrap();

            // Relay the host's offer to the requester.
            let Some(SignalingRequest::Offer { payload, .. }) = host_requests.recv().await else {
                panic!("host should send an offer");
            };
            req_events
                .send(SignalingEvent::Offer {
                    payload,
                    from_peer: host_hash.clone(),
                })
                .await
                .unwrap();

            // Relay the requester's answer back.
            let Some(SignalingRequest::Answer { payload, .. }) = req_requests.recv().await else {
                panic!("requester should answer");
            };
            host_events
                .send(SignalingEvent::Answer {
                    payload,
                    from_peer: req_hash.clone(),
                })
                .await
                .unwrap();
        }
    };

    let (host_session, req_session, ()) = tokio::join!(
        PeerSession::host(ctx_host.clone(), &mut sig_host),
        PeerSession::dial(ctx_req.clone(), &mut sig_req, &host_hash),
        broker,
    );
    let host_session = host_session.unwrap();
    let req_session = req_session.unwrap();

    assert_eq!(host_session.peer_id_hash(), req_hash);
    assert_eq!(req_session.peer_id_hash(), host_hash);
    assert!(host_session.is_connected());
    assert!(req_session.is_connected());

    // The requester cached a dialable endpoint for session resumption.
    let cached = ctx_req.store.get_cached_peer(&host_hash).unwrap().unwrap();
    assert!(cached.session_data.contains("endpoint"));
    assert!(cached.attempts_consistent());

    host_session.close("done");
    req_session.close("done");
}
