//! Single inbound message loop per session.
//!
//! Order of checks: decode, ban, rate limit, then routing. Keepalive and
//! identity frames are handled directly, transfer kinds to the pipeline,
//! verification kinds to the verifier. Handlers finish in bounded time or
//! hand work to a waiting task; the loop itself never blocks on them.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};

use crate::crypto::identity::now_ms;
use crate::error::{CryptoError, Error, ProtocolError, Result};
use crate::events::PeerEvent;
use crate::protocol::{decode_frame, ChannelMessage};
use crate::transfer::sender::AckEvent;
use crate::transport::channel::ChannelReader;
use crate::transport::session::{SessionShared, SessionTransition};

/// Drive the inbound loop until the channel dies or a fatal error closes
/// the session.
pub async fn run(shared: Arc<SessionShared>, mut reader: ChannelReader) {
    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(peer = %shared.peer.peer_id_hash, "channel closed by peer");
                shared.mark_reconnect();
                break;
            }
            Err(err) => {
                tracing::warn!(peer = %shared.peer.peer_id_hash, "channel read failed: {err}");
                shared.mark_reconnect();
                break;
            }
        };
        if frame.is_empty() {
            continue;
        }

        let message = match decode_frame(&frame) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(tag)) => {
                tracing::warn!(%tag, "ignoring unknown message type");
                continue;
            }
            Err(err) => {
                shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping malformed frame: {err}");
                continue;
            }
        };

        let peer = shared.peer.peer_id_hash.clone();
        if shared.ctx.limiter.is_banned(&peer) {
            continue;
        }
        if let Err(denied) = shared.ctx.limiter.check(&peer, message.message_type()) {
            tracing::debug!(%peer, kind = message.message_type(), "rate limited: {denied}");
            continue;
        }

        if let Err(err) = handle(&shared, message).await {
            if err.closes_session() {
                tracing::error!(%peer, "fatal inbound error: {err}");
                shared.ctx.events.emit(PeerEvent::Failure {
                    failure_kind: err.kind().to_string(),
                    reason: err.to_string(),
                    correlation: Some(peer.clone()),
                });
                shared.apply(SessionTransition::Fatal);
                break;
            }
            if matches!(err, Error::Transport(_)) {
                tracing::warn!(%peer, "outbound send failed: {err}");
                shared.mark_reconnect();
                break;
            }
            tracing::warn!(%peer, "inbound handler error: {err}");
        }
    }
}

async fn handle(shared: &Arc<SessionShared>, message: ChannelMessage) -> Result<()> {
    match message {
        ChannelMessage::Ping {
            timestamp_ms,
            signature,
        } => {
            verify_ping(shared, timestamp_ms, &signature)?;
            shared
                .writer
                .send(&ChannelMessage::Pong {
                    original_timestamp_ms: timestamp_ms,
                    peer_id_hash: shared.ctx.keys.peer_id_hash().to_string(),
                })
                .await?;
            Ok(())
        }
        ChannelMessage::Pong {
            original_timestamp_ms,
            ..
        } => {
            let latency = now_ms().saturating_sub(original_timestamp_ms);
            shared.last_pong_ms.store(now_ms(), Ordering::SeqCst);
            shared
                .ctx
                .reputation
                .record_uptime(&shared.peer.peer_id_hash, true);
            tracing::trace!(peer = %shared.peer.peer_id_hash, latency, "keepalive ack");
            Ok(())
        }
        ChannelMessage::PeerIdentity { .. } => {
            // The session is already bound to a verified identity.
            tracing::warn!(peer = %shared.peer.peer_id_hash, "unexpected re-identification");
            Ok(())
        }
        ChannelMessage::StorageCommitment { commitment } => {
            match crate::verify::verify_commitment(&commitment, &shared.peer.public_key, now_ms())
            {
                Ok(()) => {
                    let key_bytes = hex::decode(&commitment.encryption_public_key)
                        .ok()
                        .and_then(|b| <[u8; 32]>::try_from(b).ok());
                    match key_bytes {
                        Some(key) => {
                            shared.set_peer_encryption_key(key);
                            if let Err(err) =
                                shared.ctx.store.insert_commitment(&commitment.to_record())
                            {
                                tracing::warn!("commitment not persisted: {err}");
                            }
                            tracing::info!(
                                peer = %shared.peer.peer_id_hash,
                                bytes = commitment.bytes_offered,
                                "storage commitment accepted"
                            );
                        }
                        None => {
                            tracing::warn!("commitment carries malformed encryption key");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(peer = %shared.peer.peer_id_hash, "commitment rejected: {err}");
                    shared.ctx.events.emit(PeerEvent::Failure {
                        failure_kind: "verification".into(),
                        reason: err.to_string(),
                        correlation: Some(shared.peer.peer_id_hash.clone()),
                    });
                }
            }
            Ok(())
        }
        ChannelMessage::StorageChallenge { challenge } => {
            let proof = shared
                .ctx
                .verifier
                .answer(&shared.peer.peer_id_hash, &challenge);
            shared
                .writer
                .send(&ChannelMessage::StorageProof { proof })
                .await?;
            Ok(())
        }
        ChannelMessage::StorageProof { proof } => {
            // Outcome accounting happens inside the verifier; a mismatch
            // is a reputation event, never a session close.
            if let Err(err) = shared.ctx.verifier.settle(&shared.peer.peer_id_hash, &proof) {
                tracing::warn!(peer = %shared.peer.peer_id_hash, "proof rejected: {err}");
            }
            Ok(())
        }
        ChannelMessage::BackupStart {
            backup_id,
            name,
            file_count,
            total_bytes,
        } => {
            shared
                .incoming
                .handle_backup_start(shared, backup_id, name, file_count, total_bytes)
                .await
        }
        ChannelMessage::FileStart {
            transfer_id,
            file_name,
            file_size,
            total_chunks,
            chunk_size,
            file_hash,
            resume_from_chunk,
        } => {
            shared
                .incoming
                .handle_file_start(
                    shared,
                    transfer_id,
                    file_name,
                    file_size,
                    total_chunks,
                    chunk_size,
                    file_hash,
                    resume_from_chunk,
                )
                .await
        }
        ChannelMessage::FileChunk {
            transfer_id,
            chunk_index,
            chunk_size,
            payload,
            chunk_hash,
        } => {
            shared
                .incoming
                .handle_file_chunk(shared, transfer_id, chunk_index, chunk_size, payload, chunk_hash)
                .await
        }
        ChannelMessage::FileComplete { transfer_id } => {
            shared.incoming.handle_file_complete(shared, transfer_id).await
        }
        ChannelMessage::BackupComplete { backup_id } => {
            shared.incoming.handle_backup_complete(shared, backup_id).await
        }
        ChannelMessage::FileStartAck {
            transfer_id,
            ready,
            reason,
        } => {
            shared
                .acks
                .deliver(&transfer_id, AckEvent::Start { ready, reason });
            Ok(())
        }
        ChannelMessage::ChunkAck {
            transfer_id,
            chunk_index,
            received,
            error,
        } => {
            shared.acks.deliver(
                &transfer_id,
                AckEvent::Chunk {
                    index: chunk_index,
                    received,
                    error,
                },
            );
            Ok(())
        }
        ChannelMessage::FileCompleteAck {
            transfer_id,
            success,
            relative_name,
            error,
        } => {
            shared.acks.deliver(
                &transfer_id,
                AckEvent::Complete {
                    success,
                    relative_name,
                    error,
                },
            );
            Ok(())
        }
    }
}

/// Keepalive pings are signed; a bad signature is an impersonation
/// attempt and closes the session.
fn verify_ping(shared: &SessionShared, timestamp_ms: u64, signature: &str) -> Result<()> {
    let verifying = VerifyingKey::from_bytes(&shared.peer.public_key)
        .map_err(|_| Error::Crypto(CryptoError::SignatureInvalid))?;
    let sig_bytes: [u8; 64] = hex::decode(signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::Crypto(CryptoError::SignatureInvalid))?;
    verifying
        .verify_strict(
            timestamp_ms.to_string().as_bytes(),
            &Signature::from_bytes(&sig_bytes),
        )
        .map_err(|_| Error::Crypto(CryptoError::SignatureInvalid))?;
    Ok(())
}
