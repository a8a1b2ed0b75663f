//! Structured events surfaced to the UI/CLI collaborators.
//!
//! Every user-visible failure or milestone carries a stable kind, a short
//! reason, and correlating ids. Tests subscribe to the same channel, which
//! keeps component interactions observable without event-emitter fan-out.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::reputation::TrustLevel;

/// Events emitted by the peer core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerEvent {
    /// An authenticated session reached the connected state.
    PeerConnected { peer_id_hash: String },
    /// A session closed or was lost.
    PeerDisconnected { peer_id_hash: String, reason: String },
    /// Reconnect attempt outcome.
    ReconnectAttempt { peer_id_hash: String, attempt: u32, succeeded: bool },
    /// A transfer made progress.
    TransferProgress {
        backup_id: String,
        file_name: String,
        chunks_done: u32,
        chunks_total: u32,
    },
    /// A transfer finished, one way or the other.
    TransferFinished { backup_id: String, succeeded: bool, reason: Option<String> },
    /// A storage challenge settled.
    VerificationResult {
        peer_id_hash: String,
        backup_id: String,
        succeeded: bool,
        response_time_ms: u64,
    },
    /// A peer crossed a trust boundary.
    TrustChanged { peer_id_hash: String, trust: TrustLevel },
    /// A peer was banned by the rate limiter.
    PeerBanned { peer_id_hash: String, until_ms: u64 },
    /// The allocation ledger failed validation. Reportable, non-fatal.
    AllocationViolation { detail: String },
    /// A store read degraded to an empty result.
    StoreWarning { detail: String },
    /// A structured failure that did not fit a narrower event.
    Failure { failure_kind: String, reason: String, correlation: Option<String> },
}

/// Sending half handed to every component.
///
/// Cloneable and infallible from the emitter's point of view: a missing or
/// saturated consumer must never stall the core, so sends are best-effort.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<PeerEvent>,
}

impl EventSender {
    /// Emit an event without blocking. Dropped if the consumer lags.
    pub fn emit(&self, event: PeerEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::debug!("event dropped: {err}");
        }
    }

    /// A sender wired to nowhere, for tests and headless use.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/// Create an event channel with the given buffer depth.
pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<PeerEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx }, rx)
}
