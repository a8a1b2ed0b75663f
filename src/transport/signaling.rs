//! Signaling broker client.
//!
//! The broker is an untrusted matchmaking relay: it introduces two peers
//! and carries their offer/answer exchange, nothing else. No key material
//! or backup data ever transits it. The message set mirrors the broker's
//! JSON protocol; the transport is WebSocket in production and an
//! in-memory channel pair in tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;

/// Peer role assigned by the broker on a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchRole {
    Host,
    Requester,
}

/// Storage requirements attached to a connect request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotRequirements {
    pub storage: u64,
}

/// Client → broker messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum SignalingRequest {
    /// Advertise capacity and wait for a requester.
    HostSlot {
        peer_id: String,
        storage: u64,
        duration: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        public_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        trust_level: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reputation: Option<f64>,
    },
    /// Target a specific hosted slot.
    ConnectToPeer {
        target_peer_id: String,
        requester_peer_id: String,
        requirements: SlotRequirements,
    },
    /// Accept or reject an incoming connection request.
    AcceptConnection {
        requester_peer_id: String,
        accept: bool,
    },
    Offer {
        payload: serde_json::Value,
        target_peer: String,
    },
    Answer {
        payload: serde_json::Value,
        target_peer: String,
    },
    IceCandidate {
        payload: serde_json::Value,
        target_peer: String,
    },
}

/// Broker → client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum SignalingEvent {
    SlotHosted {
        #[serde(default)]
        slot_id: Option<String>,
    },
    ConnectionRequest {
        requester_peer_id: String,
        #[serde(default)]
        requirements: Option<SlotRequirements>,
    },
    PeerMatched {
        peer_id: String,
        socket_id: String,
        role: MatchRole,
    },
    ConnectionRejected {
        reason: String,
    },
    ConnectionFailed {
        error: String,
    },
    Offer {
        payload: serde_json::Value,
        from_peer: String,
    },
    Answer {
        payload: serde_json::Value,
        from_peer: String,
    },
    IceCandidate {
        payload: serde_json::Value,
        from_peer: String,
    },
}

/// The matchmaking interface the session layer depends on.
#[async_trait]
pub trait Signaling: Send {
    /// Send one request to the broker.
    async fn send(&mut self, request: SignalingRequest) -> Result<(), TransportError>;

    /// Wait for the next broker event. `Ok(None)` means the broker hung up.
    async fn recv(&mut self) -> Result<Option<SignalingEvent>, TransportError>;
}

/// WebSocket-backed broker client.
pub struct WebSocketSignaling {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WebSocketSignaling {
    /// Connect to the broker at `url` (ws:// or wss://).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Signaling(e.to_string()))?;
        tracing::info!(url, "signaling connected");
        Ok(Self { ws })
    }
}

#[async_trait]
impl Signaling for WebSocketSignaling {
    async fn send(&mut self, request: SignalingRequest) -> Result<(), TransportError> {
        let json = serde_json::to_string(&request)
            .map_err(|e| TransportError::Signaling(e.to_string()))?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Signaling(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<SignalingEvent>, TransportError> {
        while let Some(message) = self.ws.next().await {
            let message = message.map_err(|e| TransportError::Signaling(e.to_string()))?;
            match message {
                Message::Text(text) => match serde_json::from_str(&text) {
                    Ok(event) => return Ok(Some(event)),
                    Err(err) => {
                        tracing::debug!("ignoring unknown signaling frame: {err}");
                    }
                },
                Message::Close(_) => return Ok(None),
                // Control frames are answered by the library.
                _ => {}
            }
        }
        Ok(None)
    }
}

/// In-memory broker link for tests: requests flow out to the harness,
/// events flow back in.
pub struct MemorySignaling {
    pub outgoing: mpsc::Sender<SignalingRequest>,
    pub incoming: mpsc::Receiver<SignalingEvent>,
}

impl MemorySignaling {
    /// Build a client plus the harness-side handles.
    pub fn new() -> (
        Self,
        mpsc::Receiver<SignalingRequest>,
        mpsc::Sender<SignalingEvent>,
    ) {
        let (req_tx, req_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);
        (
            Self {
                outgoing: req_tx,
                incoming: event_rx,
            },
            req_rx,
            event_tx,
        )
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn send(&mut self, request: SignalingRequest) -> Result<(), TransportError> {
        self.outgoing
            .send(request)
            .await
            .map_err(|_| TransportError::Signaling("broker gone".into()))
    }

    async fn recv(&mut self) -> Result<Option<SignalingEvent>, TransportError> {
        Ok(self.incoming.recv().await)
    }
}
