//! Peer channel wire protocol.
//!
//! Messages are UTF-8 JSON objects delimited by a single newline, each
//! carrying a `type` discriminator from a closed union. Frames are decoded
//! exactly once, at the dispatcher boundary; everything inward handles
//! typed variants. Binary chunk payloads travel base64-encoded.

use serde::{Deserialize, Serialize};

use crate::crypto::{SessionProof, SignedPeerIdentity};
use crate::error::ProtocolError;
use crate::verify::{StorageChallenge, StorageCommitment, StorageProof};

/// Every message the peer channel can carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// First message on a fresh channel; everything after it must come
    /// from the verified peer.
    PeerIdentity {
        identity: SignedPeerIdentity,
        session_proof: SessionProof,
    },
    /// Signed keepalive.
    Ping {
        timestamp_ms: u64,
        signature: String,
    },
    Pong {
        original_timestamp_ms: u64,
        peer_id_hash: String,
    },
    StorageCommitment {
        commitment: StorageCommitment,
    },
    StorageChallenge {
        challenge: StorageChallenge,
    },
    StorageProof {
        proof: StorageProof,
    },
    BackupStart {
        backup_id: String,
        name: String,
        file_count: u32,
        total_bytes: u64,
    },
    FileStart {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        chunk_size: u32,
        file_hash: String,
        resume_from_chunk: u32,
    },
    FileChunk {
        transfer_id: String,
        chunk_index: u32,
        chunk_size: u32,
        /// Base64 of the sealed chunk.
        payload: String,
        /// Hex SHA-256 of the plaintext chunk.
        chunk_hash: String,
    },
    FileComplete {
        transfer_id: String,
    },
    FileStartAck {
        transfer_id: String,
        ready: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ChunkAck {
        transfer_id: String,
        chunk_index: u32,
        received: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileCompleteAck {
        transfer_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relative_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BackupComplete {
        backup_id: String,
    },
}

/// The `type` strings of the closed union, in protocol order.
pub const MESSAGE_TYPES: &[&str] = &[
    "peer_identity",
    "ping",
    "pong",
    "storage_commitment",
    "storage_challenge",
    "storage_proof",
    "backup_start",
    "file_start",
    "file_chunk",
    "file_complete",
    "file_start_ack",
    "chunk_ack",
    "file_complete_ack",
    "backup_complete",
];

impl ChannelMessage {
    /// The wire discriminator, used as the rate limiter key.
    pub fn message_type(&self) -> &'static str {
        match self {
            ChannelMessage::PeerIdentity { .. } => "peer_identity",
            ChannelMessage::Ping { .. } => "ping",
            ChannelMessage::Pong { .. } => "pong",
            ChannelMessage::StorageCommitment { .. } => "storage_commitment",
            ChannelMessage::StorageChallenge { .. } => "storage_challenge",
            ChannelMessage::StorageProof { .. } => "storage_proof",
            ChannelMessage::BackupStart { .. } => "backup_start",
            ChannelMessage::FileStart { .. } => "file_start",
            ChannelMessage::FileChunk { .. } => "file_chunk",
            ChannelMessage::FileComplete { .. } => "file_complete",
            ChannelMessage::FileStartAck { .. } => "file_start_ack",
            ChannelMessage::ChunkAck { .. } => "chunk_ack",
            ChannelMessage::FileCompleteAck { .. } => "file_complete_ack",
            ChannelMessage::BackupComplete { .. } => "backup_complete",
        }
    }

    /// Whether the dispatcher routes this to the transfer pipeline.
    pub fn is_transfer_kind(&self) -> bool {
        matches!(
            self,
            ChannelMessage::BackupStart { .. }
                | ChannelMessage::FileStart { .. }
                | ChannelMessage::FileChunk { .. }
                | ChannelMessage::FileComplete { .. }
                | ChannelMessage::FileStartAck { .. }
                | ChannelMessage::ChunkAck { .. }
                | ChannelMessage::FileCompleteAck { .. }
                | ChannelMessage::BackupComplete { .. }
        )
    }

    /// Whether the dispatcher routes this to the verification component.
    pub fn is_verification_kind(&self) -> bool {
        matches!(
            self,
            ChannelMessage::StorageCommitment { .. }
                | ChannelMessage::StorageChallenge { .. }
                | ChannelMessage::StorageProof { .. }
        )
    }
}

/// Encode a message as one newline-terminated frame.
pub fn encode_frame(message: &ChannelMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decode one frame. Unknown `type` tags and malformed bodies are
/// distinguished so the dispatcher can count them separately.
pub fn decode_frame(line: &str) -> Result<ChannelMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(line.trim_end())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing type discriminator".into()))?;
    if !MESSAGE_TYPES.contains(&tag) {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let message = ChannelMessage::FileChunk {
            transfer_id: "t1".into(),
            chunk_index: 2,
            chunk_size: 32_768,
            payload: "AAECAw==".into(),
            chunk_hash: "ab".repeat(32),
        };
        let frame = encode_frame(&message).unwrap();
        assert!(frame.ends_with('\n'));
        assert!(frame.contains(r#""type":"file_chunk""#));
        assert_eq!(decode_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_unknown_type_distinguished() {
        let err = decode_frame(r#"{"type":"teleport","x":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("teleport".into()));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            decode_frame("not json at all"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"no_type":true}"#),
            Err(ProtocolError::Malformed(_))
        ));
        // Right tag, wrong body.
        assert!(matches!(
            decode_frame(r#"{"type":"ping"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_every_type_string_is_reachable() {
        let message = ChannelMessage::Pong {
            original_timestamp_ms: 7,
            peer_id_hash: "feedfacecafebeef".into(),
        };
        assert!(MESSAGE_TYPES.contains(&message.message_type()));
        assert!(!message.is_transfer_kind());
        assert!(!message.is_verification_kind());

        let message = ChannelMessage::BackupComplete {
            backup_id: "b".into(),
        };
        assert!(message.is_transfer_kind());
    }

    #[test]
    fn test_ack_reason_omitted_when_clean() {
        let frame = encode_frame(&ChannelMessage::ChunkAck {
            transfer_id: "t".into(),
            chunk_index: 0,
            received: true,
            error: None,
        })
        .unwrap();
        assert!(!frame.contains("error"));
    }
}
