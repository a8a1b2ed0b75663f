//! Peer session lifecycle.
//!
//! A session moves idle → matching → handshaking → connected, with
//! reconnecting and closed as the off-ramps. Matching goes through the
//! signaling broker; the handshake exchanges signed identities and session
//! proofs over the fresh channel; connected spawns the dispatcher and the
//! keepalive task. Closing cancels everything the session owns; transfers
//! stay resumable through their persisted chunk state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::channel::{open_channel, ChannelReader, ChannelWriter, DataStream};
use super::signaling::{
    MatchRole, Signaling, SignalingEvent, SignalingRequest, SlotRequirements,
};
use crate::context::PeerContext;
use crate::crypto::identity::now_ms;
use crate::crypto::{
    session_proof, signed_identity, verify_identity, verify_session_proof, VerifiedIdentity,
};
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::events::PeerEvent;
use crate::protocol::{decode_frame, ChannelMessage};
use crate::store::CachedPeerConnection;
use crate::transfer::receiver::IncomingTransfers;
use crate::transfer::sender::AckRouter;
use crate::verify::build_commitment;

/// Commitment lifetime offered to counterparties.
const COMMITMENT_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Cached sessions older than this fall back to signaling.
const RESUME_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Lifecycle states of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Matching,
    Handshaking,
    Connected,
    Reconnecting,
    Closed,
}

/// Events that drive state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    StartMatching,
    Matched,
    Authenticated,
    BadIdentity,
    MatchTimeout,
    Disconnected,
    Reconnected,
    Fatal,
    Close,
}

impl SessionState {
    /// Total transition function; undefined pairs hold the current state.
    pub fn advance(self, transition: SessionTransition) -> SessionState {
        use SessionState::*;
        use SessionTransition::*;

        match (self, transition) {
            (_, Close) | (_, Fatal) => Closed,
            (Idle, StartMatching) => Matching,
            (Matching, Matched) => Handshaking,
            (Matching, MatchTimeout) => Idle,
            (Handshaking, Authenticated) => Connected,
            (Handshaking, BadIdentity) => Closed,
            (Connected, Disconnected) => Reconnecting,
            (Reconnecting, Reconnected) => Connected,
            (Reconnecting, MatchTimeout) => Closed,
            (state, _) => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// State shared between the session's tasks and the components it feeds.
pub struct SessionShared {
    pub ctx: PeerContext,
    pub writer: ChannelWriter,
    pub peer: VerifiedIdentity,
    state: Mutex<SessionState>,
    peer_encryption_key: Mutex<Option<[u8; 32]>>,
    pub last_pong_ms: AtomicU64,
    pub reconnect_needed: AtomicBool,
    pub malformed_frames: AtomicU64,
    pub acks: AckRouter,
    pub incoming: IncomingTransfers,
}

impl SessionShared {
    fn new(ctx: PeerContext, writer: ChannelWriter, peer: VerifiedIdentity) -> Self {
        let chunks_dir = ctx.config.chunks_dir();
        let received_dir = ctx.config.received_dir();
        Self {
            ctx,
            writer,
            peer,
            state: Mutex::new(SessionState::Handshaking),
            peer_encryption_key: Mutex::new(None),
            last_pong_ms: AtomicU64::new(now_ms()),
            reconnect_needed: AtomicBool::new(false),
            malformed_frames: AtomicU64::new(0),
            acks: AckRouter::new(),
            incoming: IncomingTransfers::new(chunks_dir, received_dir),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn apply(&self, transition: SessionTransition) -> SessionState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = state.advance(transition);
        *state
    }

    /// The peer's X25519 key, once its commitment has been verified.
    pub fn peer_encryption_key(&self) -> Option<[u8; 32]> {
        *self
            .peer_encryption_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_peer_encryption_key(&self, key: [u8; 32]) {
        *self
            .peer_encryption_key
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(key);
    }

    /// The symmetric key chunks to and from this peer are sealed under.
    /// `None` until the commitment exchange has completed.
    pub fn shared_secret(&self) -> Option<[u8; 32]> {
        let their_public = self.peer_encryption_key()?;
        Some(
            self.ctx
                .secrets
                .shared_key(&self.peer.peer_id_hash, &their_public),
        )
    }

    /// Flag the session for reconnect; the supervisor picks this up.
    pub fn mark_reconnect(&self) {
        self.reconnect_needed.store(true, Ordering::SeqCst);
        self.apply(SessionTransition::Disconnected);
    }
}

/// A live, authenticated session with one peer.
pub struct PeerSession {
    pub shared: Arc<SessionShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerSession {
    /// Run the handshake over an established stream and start the session
    /// tasks. `endpoint` is the dialable address cached for resumption,
    /// when we know one.
    pub async fn establish(
        ctx: PeerContext,
        stream: Box<dyn DataStream>,
        candidate_fingerprint: Option<String>,
        endpoint: Option<String>,
    ) -> Result<PeerSession> {
        let (mut reader, writer) = open_channel(stream, ctx.config.send_timeout());

        let started = Instant::now();
        let verified =
            match handshake(&ctx, &mut reader, &writer, candidate_fingerprint.as_deref()).await {
                Ok(verified) => verified,
                Err(err) => {
                    tracing::warn!("handshake failed: {err}");
                    return Err(err);
                }
            };
        let latency_ms = started.elapsed().as_millis() as u64;

        ctx.reputation
            .record_connection(&verified.peer_id_hash, true, Some(latency_ms));
        persist_peer(&ctx, &verified, endpoint.as_deref(), true);

        // Offer our storage commitment immediately on entering connected.
        let offer = ctx
            .config
            .max_offered_bytes
            .clamp(crate::verify::MIN_COMMITMENT_BYTES, crate::verify::MAX_COMMITMENT_BYTES);
        let commitment = build_commitment(&ctx.keys, offer, "24/7", COMMITMENT_RETENTION_MS);
        writer
            .send(&ChannelMessage::StorageCommitment { commitment })
            .await?;

        let events = ctx.events.clone();
        let shared = Arc::new(SessionShared::new(ctx, writer, verified));
        shared.apply(SessionTransition::Authenticated);
        events.emit(PeerEvent::PeerConnected {
            peer_id_hash: shared.peer.peer_id_hash.clone(),
        });

        let dispatcher = {
            let shared = shared.clone();
            tokio::spawn(async move {
                crate::dispatch::run(shared, reader).await;
            })
        };
        let keepalive = {
            let shared = shared.clone();
            tokio::spawn(async move {
                keepalive_loop(shared).await;
            })
        };

        Ok(PeerSession {
            shared,
            tasks: vec![dispatcher, keepalive],
        })
    }

    /// Host a slot at the broker and wait for a requester.
    pub async fn host(ctx: PeerContext, signaling: &mut dyn Signaling) -> Result<PeerSession> {
        let matched = tokio::time::timeout(
            ctx.config.connect_timeout(),
            host_and_accept(&ctx, signaling),
        )
        .await
        .map_err(|_| TransportError::MatchingTimeout)??;
        Self::establish(
            ctx,
            matched.stream,
            Some(matched.fingerprint),
            matched.endpoint,
        )
        .await
    }

    /// Request a specific hosted peer through the broker.
    pub async fn dial(
        ctx: PeerContext,
        signaling: &mut dyn Signaling,
        target_peer_id: &str,
    ) -> Result<PeerSession> {
        let matched = tokio::time::timeout(
            ctx.config.connect_timeout(),
            dial_peer(&ctx, signaling, target_peer_id),
        )
        .await
        .map_err(|_| TransportError::MatchingTimeout)??;
        Self::establish(
            ctx,
            matched.stream,
            Some(matched.fingerprint),
            matched.endpoint,
        )
        .await
    }

    /// Try to re-establish a dropped session from the cached endpoint,
    /// with exponential backoff. Falls through with an error when the
    /// cache is cold; the caller then goes back to signaling.
    pub async fn reconnect(ctx: PeerContext, peer_id_hash: &str) -> Result<PeerSession> {
        let cached = match ctx.store.get_cached_peer(peer_id_hash) {
            Ok(Some(cached)) => cached,
            Ok(None) => return Err(TransportError::MatchingTimeout.into()),
            Err(err) => {
                ctx.events.emit(PeerEvent::StoreWarning {
                    detail: format!("cached peer read failed: {err}"),
                });
                return Err(TransportError::MatchingTimeout.into());
            }
        };

        if now_ms().saturating_sub(cached.last_seen_ms) > RESUME_WINDOW_MS {
            return Err(TransportError::MatchingTimeout.into());
        }
        let endpoint: Option<String> = serde_json::from_str::<serde_json::Value>(&cached.session_data)
            .ok()
            .and_then(|v| v.get("endpoint").and_then(|e| e.as_str()).map(String::from));
        let Some(endpoint) = endpoint.filter(|e| !e.is_empty()) else {
            return Err(TransportError::MatchingTimeout.into());
        };

        let max_attempts = ctx.config.max_reconnect_attempts;
        let base = ctx.config.reconnect_base_ms;
        for attempt in 1..=max_attempts {
            let delay = base.saturating_mul(1u64 << (attempt - 1));
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;

            match TcpStream::connect(&endpoint).await {
                Ok(stream) => {
                    let fingerprint = endpoint_fingerprint(&endpoint);
                    match Self::establish(
                        ctx.clone(),
                        Box::new(stream),
                        Some(fingerprint),
                        Some(endpoint.clone()),
                    )
                    .await
                    {
                        Ok(session) => {
                            ctx.events.emit(PeerEvent::ReconnectAttempt {
                                peer_id_hash: peer_id_hash.to_string(),
                                attempt,
                                succeeded: true,
                            });
                            return Ok(session);
                        }
                        Err(err) => {
                            tracing::debug!(attempt, "reconnect handshake failed: {err}");
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(attempt, "reconnect dial failed: {err}");
                }
            }
            ctx.events.emit(PeerEvent::ReconnectAttempt {
                peer_id_hash: peer_id_hash.to_string(),
                attempt,
                succeeded: false,
            });
            ctx.reputation.record_connection(peer_id_hash, false, None);
        }
        Err(TransportError::MatchingTimeout.into())
    }

    pub fn peer_id_hash(&self) -> &str {
        &self.shared.peer.peer_id_hash
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().is_connected()
    }

    /// Whether the session lost its channel and wants a reconnect.
    pub fn needs_reconnect(&self) -> bool {
        self.shared.reconnect_needed.load(Ordering::SeqCst)
    }

    /// Close the session: cancel every owned task and drop the channel.
    /// In-flight transfers stay resumable via their persisted chunk state.
    pub fn close(self, reason: &str) {
        self.shared.apply(SessionTransition::Close);
        for task in &self.tasks {
            task.abort();
        }
        self.shared.ctx.events.emit(PeerEvent::PeerDisconnected {
            peer_id_hash: self.shared.peer.peer_id_hash.clone(),
            reason: reason.to_string(),
        });
    }
}

/// Exchange signed identities and session proofs over a fresh channel.
pub async fn handshake(
    ctx: &PeerContext,
    reader: &mut ChannelReader,
    writer: &ChannelWriter,
    candidate_fingerprint: Option<&str>,
) -> Result<VerifiedIdentity> {
    let ours = signed_identity(
        &ctx.keys,
        ctx.config.protocol_version,
        vec!["backup-exchange".to_string()],
    );
    let proof = session_proof(&ctx.keys, candidate_fingerprint);
    writer
        .send(&ChannelMessage::PeerIdentity {
            identity: ours,
            session_proof: proof,
        })
        .await?;

    let frame = tokio::time::timeout(ctx.config.connect_timeout(), reader.next_frame())
        .await
        .map_err(|_| TransportError::MatchingTimeout)?
        .map_err(Error::Transport)?
        .ok_or(TransportError::ChannelClosed)?;

    let message = decode_frame(&frame)?;
    let ChannelMessage::PeerIdentity {
        identity,
        session_proof: their_proof,
    } = message
    else {
        return Err(ProtocolError::Malformed("expected peer_identity first".into()).into());
    };

    let now = now_ms();
    let claimed = identity.peer_id_hash.clone();
    let verified = verify_identity(&identity, ctx.config.protocol_version, now).map_err(|err| {
        ctx.reputation.record_connection(&claimed, false, None);
        err
    })?;
    verify_session_proof(&their_proof, &verified.public_key, now).map_err(|err| {
        ctx.reputation
            .record_connection(&verified.peer_id_hash, false, None);
        err
    })?;

    tracing::info!(peer = %verified.peer_id_hash, "peer authenticated");
    Ok(verified)
}

/// Signed keepalive: ping every interval, two missed acks disconnect.
pub async fn keepalive_loop(shared: Arc<SessionShared>) {
    let interval = shared.ctx.config.keepalive_interval();
    let interval_ms = interval.as_millis() as u64;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !shared.state().is_connected() {
            break;
        }

        let silent_for = now_ms().saturating_sub(shared.last_pong_ms.load(Ordering::SeqCst));
        if silent_for > 2 * interval_ms {
            tracing::warn!(peer = %shared.peer.peer_id_hash, "keepalive acks missing");
            shared
                .ctx
                .reputation
                .record_uptime(&shared.peer.peer_id_hash, false);
            shared.mark_reconnect();
            break;
        }

        let timestamp_ms = now_ms();
        let signature = hex::encode(
            shared
                .ctx
                .keys
                .sign(timestamp_ms.to_string().as_bytes()),
        );
        if shared
            .writer
            .send(&ChannelMessage::Ping {
                timestamp_ms,
                signature,
            })
            .await
            .is_err()
        {
            shared.mark_reconnect();
            break;
        }
    }
}

struct MatchedConnection {
    stream: Box<dyn DataStream>,
    fingerprint: String,
    endpoint: Option<String>,
}

/// Advertise a slot, accept the first requester, and hand them a direct
/// endpoint through the broker's offer/answer exchange.
async fn host_and_accept(
    ctx: &PeerContext,
    signaling: &mut dyn Signaling,
) -> Result<MatchedConnection> {
    signaling
        .send(SignalingRequest::HostSlot {
            peer_id: ctx.keys.peer_id_hash().to_string(),
            storage: ctx.config.max_offered_bytes,
            duration: COMMITMENT_RETENTION_MS,
            location: None,
            description: None,
            public_key: hex::encode(ctx.keys.verifying_key().as_bytes()),
            trust_level: None,
            reputation: None,
        })
        .await?;

    let mut listener: Option<TcpListener> = None;
    let mut matched_peer: Option<String> = None;

    loop {
        let event = signaling
            .recv()
            .await?
            .ok_or(TransportError::ChannelClosed)?;
        match event {
            SignalingEvent::SlotHosted { .. } => {}
            SignalingEvent::ConnectionRequest {
                requester_peer_id, ..
            } => {
                signaling
                    .send(SignalingRequest::AcceptConnection {
                        requester_peer_id,
                        accept: true,
                    })
                    .await?;
            }
            SignalingEvent::PeerMatched { peer_id, role, .. } => {
                if role != MatchRole::Host {
                    return Err(
                        TransportError::Signaling("expected host role".to_string()).into()
                    );
                }
                let bound = TcpListener::bind((ctx.config.advertise_host.as_str(), 0))
                    .await
                    .map_err(TransportError::Io)?;
                let port = bound.local_addr().map_err(TransportError::Io)?.port();
                let endpoint = format!("{}:{}", ctx.config.advertise_host, port);
                let fingerprint = endpoint_fingerprint(&endpoint);
                signaling
                    .send(SignalingRequest::Offer {
                        payload: serde_json::json!({
                            "endpoint": endpoint,
                            "fingerprint": fingerprint,
                        }),
                        target_peer: peer_id.clone(),
                    })
                    .await?;
                listener = Some(bound);
                matched_peer = Some(peer_id);
            }
            SignalingEvent::Answer { .. } => {
                let listener = listener
                    .take()
                    .ok_or_else(|| TransportError::Signaling("answer before offer".into()))?;
                let (stream, addr) = listener.accept().await.map_err(TransportError::Io)?;
                tracing::debug!(peer = ?matched_peer, %addr, "direct channel accepted");
                let endpoint = format!("{}", addr);
                return Ok(MatchedConnection {
                    fingerprint: endpoint_fingerprint(&endpoint),
                    stream: Box::new(stream),
                    // The requester dialed us; we have no address to call back.
                    endpoint: None,
                });
            }
            SignalingEvent::ConnectionRejected { reason } => {
                return Err(TransportError::Signaling(reason).into());
            }
            SignalingEvent::ConnectionFailed { error } => {
                return Err(TransportError::Signaling(error).into());
            }
            SignalingEvent::Offer { .. } | SignalingEvent::IceCandidate { .. } => {}
        }
    }
}

/// Request a hosted slot and dial the endpoint from the host's offer.
async fn dial_peer(
    ctx: &PeerContext,
    signaling: &mut dyn Signaling,
    target_peer_id: &str,
) -> Result<MatchedConnection> {
    signaling
        .send(SignalingRequest::ConnectToPeer {
            target_peer_id: target_peer_id.to_string(),
            requester_peer_id: ctx.keys.peer_id_hash().to_string(),
            requirements: SlotRequirements {
                storage: ctx.config.max_offered_bytes,
            },
        })
        .await?;

    loop {
        let event = signaling
            .recv()
            .await?
            .ok_or(TransportError::ChannelClosed)?;
        match event {
            SignalingEvent::PeerMatched { role, .. } => {
                if role != MatchRole::Requester {
                    return Err(
                        TransportError::Signaling("expected requester role".to_string()).into(),
                    );
                }
            }
            SignalingEvent::Offer { payload, from_peer } => {
                let endpoint = payload
                    .get("endpoint")
                    .and_then(|e| e.as_str())
                    .ok_or_else(|| TransportError::Signaling("offer without endpoint".into()))?
                    .to_string();
                let fingerprint = endpoint_fingerprint(&endpoint);
                signaling
                    .send(SignalingRequest::Answer {
                        payload: serde_json::json!({ "fingerprint": fingerprint }),
                        target_peer: from_peer,
                    })
                    .await?;
                let stream = TcpStream::connect(&endpoint)
                    .await
                    .map_err(TransportError::Io)?;
                return Ok(MatchedConnection {
                    stream: Box::new(stream),
                    fingerprint,
                    endpoint: Some(endpoint),
                });
            }
            SignalingEvent::ConnectionRejected { reason } => {
                return Err(TransportError::Signaling(reason).into());
            }
            SignalingEvent::ConnectionFailed { error } => {
                return Err(TransportError::Signaling(error).into());
            }
            _ => {}
        }
    }
}

/// Stable fingerprint binding session proofs to the negotiated endpoint.
pub fn endpoint_fingerprint(endpoint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Record the peer and its reconnect material after a handshake.
fn persist_peer(
    ctx: &PeerContext,
    verified: &VerifiedIdentity,
    endpoint: Option<&str>,
    success: bool,
) {
    let now = now_ms();
    let trust = ctx.reputation.trust_level(&verified.peer_id_hash);

    if let Err(err) = ctx.store.upsert_peer(&crate::store::PeerRecord {
        peer_id_hash: verified.peer_id_hash.clone(),
        public_key: hex::encode(verified.public_key),
        trust_level: trust,
        metadata: None,
        first_seen_ms: now,
        last_seen_ms: now,
    }) {
        tracing::warn!("peer row not persisted: {err}");
    }

    let previous = ctx
        .store
        .get_cached_peer(&verified.peer_id_hash)
        .ok()
        .flatten();
    let (total, successful) = previous
        .as_ref()
        .map(|c| (c.total_attempts, c.successful_attempts))
        .unwrap_or((0, 0));
    let session_data = match endpoint {
        Some(endpoint) => serde_json::json!({ "endpoint": endpoint }).to_string(),
        None => previous
            .map(|c| c.session_data)
            .unwrap_or_else(|| "{}".to_string()),
    };

    let cached = CachedPeerConnection {
        peer_id_hash: verified.peer_id_hash.clone(),
        public_key: hex::encode(verified.public_key),
        session_data,
        last_seen_ms: now,
        trust_level: trust,
        total_attempts: total + 1,
        successful_attempts: successful + u32::from(success),
        last_success_ms: success.then_some(now),
    };
    if let Err(err) = ctx.store.upsert_cached_peer(&cached) {
        tracing::warn!("cached connection not persisted: {err}");
    }
}
