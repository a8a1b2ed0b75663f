//! Relational store backed by SQLite.
//!
//! Writes are serialized behind a single connection mutex; reads tolerate
//! concurrency at the call sites by cloning the handle. Sensitive columns
//! are sealed by the [`FieldCrypter`] before parameters are bound and
//! unsealed on every read; a value that fails to unseal surfaces a
//! field-decrypt error, never ciphertext.

use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::crypter::{FieldCrypter, SALT_LEN};
use super::records::*;
use crate::error::StoreError;
use crate::reputation::TrustLevel;

const CHALLENGE_RETENTION_MS: u64 = 365 * 24 * 60 * 60 * 1000;
const CACHED_PEER_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1000;
const CHUNK_STATE_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// What a maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub challenges_purged: usize,
    pub sessions_purged: usize,
    pub cached_peers_purged: usize,
    pub chunk_states_purged: usize,
}

/// Handle to the peer's durable state.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    crypter: FieldCrypter,
}

impl Store {
    /// Open (or create) the database at `path` and derive the field key
    /// from `seed` and the database's own salt.
    pub fn open(path: &Path, seed: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::bootstrap(conn, seed)
    }

    /// An in-memory store for tests.
    pub fn in_memory(seed: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn, seed)
    }

    fn bootstrap(conn: Connection, seed: &str) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Schema(e.to_string()))?;

        let salt = read_or_create_salt(&conn)?;
        let crypter = FieldCrypter::derive(seed, &salt);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            crypter,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- backups -------------------------------------------------------

    /// Insert or replace a backup record.
    pub fn upsert_backup(&self, backup: &BackupRecord) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&backup.metadata)
            .map_err(|e| StoreError::Corrupt(format!("backup metadata: {e}")))?;
        self.lock().execute(
            "INSERT INTO backups (id, name, direction, peer_id_hash, created_at_ms, status, file_count, total_bytes, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name, status = excluded.status,
               file_count = excluded.file_count, total_bytes = excluded.total_bytes,
               metadata = excluded.metadata",
            params![
                backup.id,
                backup.name,
                backup.direction.as_str(),
                backup.peer_id_hash,
                backup.created_at_ms as i64,
                backup.status.as_str(),
                backup.file_count,
                backup.total_bytes as i64,
                metadata,
            ],
        )?;
        Ok(())
    }

    /// Fetch one backup.
    pub fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, direction, peer_id_hash, created_at_ms, status, file_count, total_bytes, metadata
                 FROM backups WHERE id = ?1",
                params![id],
                map_backup_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Update only a backup's status. Completed backups are immutable
    /// apart from this transition.
    pub fn set_backup_status(&self, id: &str, status: BackupStatus) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE backups SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// List backups, optionally filtered.
    pub fn list_backups(
        &self,
        direction: Option<Direction>,
        status: Option<BackupStatus>,
    ) -> Result<Vec<BackupRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, direction, peer_id_hash, created_at_ms, status, file_count, total_bytes, metadata
             FROM backups
             WHERE (?1 IS NULL OR direction = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at_ms",
        )?;
        let rows = stmt.query_map(
            params![
                direction.map(|d| d.as_str()),
                status.map(|s| s.as_str())
            ],
            map_backup_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Remove a backup and its dependent rows.
    pub fn delete_backup(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM transfer_chunk_states WHERE backup_id = ?1", params![id])?;
        tx.execute("DELETE FROM backup_files WHERE backup_id = ?1", params![id])?;
        tx.execute("DELETE FROM sync_schedules WHERE backup_id = ?1", params![id])?;
        tx.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // ---- backup files --------------------------------------------------

    /// Insert or replace a file row.
    pub fn upsert_backup_file(&self, file: &BackupFileRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO backup_files (backup_id, path, size, hash, chunk_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(backup_id, path) DO UPDATE SET
               size = excluded.size, hash = excluded.hash,
               chunk_count = excluded.chunk_count, status = excluded.status",
            params![
                file.backup_id,
                file.path,
                file.size as i64,
                file.hash,
                file.chunk_count,
                file.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Update a file's transfer status.
    pub fn set_file_status(
        &self,
        backup_id: &str,
        path: &str,
        status: TransferState,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE backup_files SET status = ?3 WHERE backup_id = ?1 AND path = ?2",
            params![backup_id, path, status.as_str()],
        )?;
        Ok(())
    }

    /// Files belonging to a backup, in insertion order.
    pub fn list_backup_files(&self, backup_id: &str) -> Result<Vec<BackupFileRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT backup_id, path, size, hash, chunk_count, status
             FROM backup_files WHERE backup_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![backup_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (backup_id, path, size, hash, chunk_count, status) = row?;
            out.push(BackupFileRecord {
                backup_id,
                path,
                size: size as u64,
                hash,
                chunk_count,
                status: TransferState::parse(&status)
                    .ok_or_else(|| StoreError::Corrupt(format!("file status {status}")))?,
            });
        }
        Ok(out)
    }

    // ---- chunk states --------------------------------------------------

    /// Insert or replace the durable state of one chunk.
    pub fn upsert_chunk_state(&self, chunk: &ChunkStateRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO transfer_chunk_states
               (backup_id, chunk_index, chunk_hash, chunk_size, state, attempt_count, last_attempt_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(backup_id, chunk_index) DO UPDATE SET
               chunk_hash = excluded.chunk_hash, chunk_size = excluded.chunk_size,
               state = excluded.state, attempt_count = excluded.attempt_count,
               last_attempt_ms = excluded.last_attempt_ms, error = excluded.error",
            params![
                chunk.backup_id,
                chunk.chunk_index,
                chunk.chunk_hash,
                chunk.chunk_size,
                chunk.state.as_str(),
                chunk.attempt_count,
                chunk.last_attempt_ms as i64,
                chunk.error,
            ],
        )?;
        Ok(())
    }

    /// Every chunk not yet completed or verified, ordered by index. This is
    /// the resumption query.
    pub fn incomplete_chunks(&self, backup_id: &str) -> Result<Vec<ChunkStateRecord>, StoreError> {
        self.chunk_query(
            backup_id,
            "SELECT backup_id, chunk_index, chunk_hash, chunk_size, state, attempt_count, last_attempt_ms, error
             FROM transfer_chunk_states
             WHERE backup_id = ?1 AND state NOT IN ('completed', 'verified')
             ORDER BY chunk_index",
        )
    }

    /// All chunk states for a backup, ordered by index.
    pub fn chunk_states(&self, backup_id: &str) -> Result<Vec<ChunkStateRecord>, StoreError> {
        self.chunk_query(
            backup_id,
            "SELECT backup_id, chunk_index, chunk_hash, chunk_size, state, attempt_count, last_attempt_ms, error
             FROM transfer_chunk_states WHERE backup_id = ?1 ORDER BY chunk_index",
        )
    }

    fn chunk_query(
        &self,
        backup_id: &str,
        sql: &str,
    ) -> Result<Vec<ChunkStateRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![backup_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (backup_id, chunk_index, chunk_hash, chunk_size, state, attempts, last, error) =
                row?;
            out.push(ChunkStateRecord {
                backup_id,
                chunk_index,
                chunk_hash,
                chunk_size,
                state: TransferState::parse(&state)
                    .ok_or_else(|| StoreError::Corrupt(format!("chunk state {state}")))?,
                attempt_count: attempts,
                last_attempt_ms: last as u64,
                error,
            });
        }
        Ok(out)
    }

    // ---- peers ---------------------------------------------------------

    /// Insert or update a peer row. Key and metadata are sealed first.
    pub fn upsert_peer(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        let key = self.crypter.encrypt(peer.public_key.as_bytes())?;
        let metadata = peer
            .metadata
            .as_ref()
            .map(|m| self.crypter.encrypt(m.as_bytes()))
            .transpose()?;
        self.lock().execute(
            "INSERT INTO peers (peer_id_hash, public_key, trust_level, metadata, first_seen_ms, last_seen_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(peer_id_hash) DO UPDATE SET
               public_key = excluded.public_key, trust_level = excluded.trust_level,
               metadata = excluded.metadata, last_seen_ms = excluded.last_seen_ms",
            params![
                peer.peer_id_hash,
                key,
                peer.trust_level.as_str(),
                metadata,
                peer.first_seen_ms as i64,
                peer.last_seen_ms as i64,
            ],
        )?;
        Ok(())
    }

    /// Fetch and unseal a peer row.
    pub fn get_peer(&self, peer_id_hash: &str) -> Result<Option<PeerRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT peer_id_hash, public_key, trust_level, metadata, first_seen_ms, last_seen_ms
                 FROM peers WHERE peer_id_hash = ?1",
                params![peer_id_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((hash, key, trust, metadata, first, last)) = row else {
            return Ok(None);
        };
        drop(conn);
        Ok(Some(PeerRecord {
            peer_id_hash: hash,
            public_key: self.crypter.decrypt_string("peers.public_key", &key)?,
            trust_level: TrustLevel::parse(&trust)
                .ok_or_else(|| StoreError::Corrupt(format!("trust level {trust}")))?,
            metadata: metadata
                .map(|m| self.crypter.decrypt_string("peers.metadata", &m))
                .transpose()?,
            first_seen_ms: first as u64,
            last_seen_ms: last as u64,
        }))
    }

    // ---- storage commitments -------------------------------------------

    /// Persist a commitment. The signature column is sealed.
    pub fn insert_commitment(&self, commitment: &CommitmentRecord) -> Result<(), StoreError> {
        let signature = self.crypter.encrypt(commitment.signature.as_bytes())?;
        self.lock().execute(
            "INSERT INTO storage_commitments
               (peer_id_hash, encryption_public_key, bytes_offered, availability, retention_ms, created_ms, expires_ms, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                commitment.peer_id_hash,
                commitment.encryption_public_key,
                commitment.bytes_offered as i64,
                commitment.availability,
                commitment.retention_ms as i64,
                commitment.created_ms as i64,
                commitment.expires_ms as i64,
                signature,
            ],
        )?;
        Ok(())
    }

    /// The most recent commitment from a peer, if any.
    pub fn latest_commitment(
        &self,
        peer_id_hash: &str,
    ) -> Result<Option<CommitmentRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT peer_id_hash, encryption_public_key, bytes_offered, availability, retention_ms, created_ms, expires_ms, signature
                 FROM storage_commitments WHERE peer_id_hash = ?1
                 ORDER BY created_ms DESC LIMIT 1",
                params![peer_id_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Vec<u8>>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((peer, key, bytes, avail, retention, created, expires, signature)) = row else {
            return Ok(None);
        };
        drop(conn);
        Ok(Some(CommitmentRecord {
            peer_id_hash: peer,
            encryption_public_key: key,
            bytes_offered: bytes as u64,
            availability: avail,
            retention_ms: retention as u64,
            created_ms: created as u64,
            expires_ms: expires as u64,
            signature: self
                .crypter
                .decrypt_string("storage_commitments.signature", &signature)?,
        }))
    }

    // ---- verification challenges ---------------------------------------

    /// Persist a freshly issued challenge. Parameters are sealed.
    pub fn insert_challenge(&self, challenge: &ChallengeRecord) -> Result<(), StoreError> {
        let data = self.crypter.encrypt(challenge.challenge_data.as_bytes())?;
        let response = challenge
            .response_data
            .as_ref()
            .map(|r| self.crypter.encrypt(r.as_bytes()))
            .transpose()?;
        self.lock().execute(
            "INSERT INTO verification_challenges
               (id, backup_id, peer_id_hash, kind, challenge_data, response_data, status, issued_ms, expires_ms, response_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                challenge.id,
                challenge.backup_id,
                challenge.peer_id_hash,
                challenge.kind,
                data,
                response,
                challenge.status.as_str(),
                challenge.issued_ms as i64,
                challenge.expires_ms as i64,
                challenge.response_time_ms.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    /// Record the outcome of a challenge.
    pub fn settle_challenge(
        &self,
        id: &str,
        status: ChallengeStatus,
        response_data: Option<&str>,
        response_time_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let response = response_data
            .map(|r| self.crypter.encrypt(r.as_bytes()))
            .transpose()?;
        self.lock().execute(
            "UPDATE verification_challenges
             SET status = ?2, response_data = ?3, response_time_ms = ?4
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                response,
                response_time_ms.map(|v| v as i64)
            ],
        )?;
        Ok(())
    }

    /// Fetch and unseal one challenge.
    pub fn get_challenge(&self, id: &str) -> Result<Option<ChallengeRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, backup_id, peer_id_hash, kind, challenge_data, response_data, status, issued_ms, expires_ms, response_time_ms
                 FROM verification_challenges WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Option<Vec<u8>>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, Option<i64>>(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, backup, peer, kind, data, response, status, issued, expires, rt)) = row
        else {
            return Ok(None);
        };
        drop(conn);
        Ok(Some(ChallengeRecord {
            id,
            backup_id: backup,
            peer_id_hash: peer,
            kind,
            challenge_data: self
                .crypter
                .decrypt_string("verification_challenges.challenge_data", &data)?,
            response_data: response
                .map(|r| {
                    self.crypter
                        .decrypt_string("verification_challenges.response_data", &r)
                })
                .transpose()?,
            status: ChallengeStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("challenge status {status}")))?,
            issued_ms: issued as u64,
            expires_ms: expires as u64,
            response_time_ms: rt.map(|v| v as u64),
        }))
    }

    // ---- transfer sessions ---------------------------------------------

    /// Insert or replace a transfer session row.
    pub fn upsert_transfer_session(
        &self,
        session: &TransferSessionRecord,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO transfer_sessions (id, backup_id, peer_id_hash, direction, status, started_ms, updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, updated_ms = excluded.updated_ms",
            params![
                session.id,
                session.backup_id,
                session.peer_id_hash,
                session.direction.as_str(),
                session.status.as_str(),
                session.started_ms as i64,
                session.updated_ms as i64,
            ],
        )?;
        Ok(())
    }

    // ---- cached peer connections ---------------------------------------

    /// Insert or update the cached reconnect material for a peer.
    pub fn upsert_cached_peer(&self, cached: &CachedPeerConnection) -> Result<(), StoreError> {
        debug_assert!(cached.attempts_consistent());
        let key = self.crypter.encrypt(cached.public_key.as_bytes())?;
        let session = self.crypter.encrypt(cached.session_data.as_bytes())?;
        self.lock().execute(
            "INSERT INTO cached_peer_connections
               (peer_id_hash, public_key, session_data, last_seen_ms, trust_level, total_attempts, successful_attempts, last_success_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(peer_id_hash) DO UPDATE SET
               public_key = excluded.public_key, session_data = excluded.session_data,
               last_seen_ms = excluded.last_seen_ms, trust_level = excluded.trust_level,
               total_attempts = excluded.total_attempts,
               successful_attempts = excluded.successful_attempts,
               last_success_ms = excluded.last_success_ms",
            params![
                cached.peer_id_hash,
                key,
                session,
                cached.last_seen_ms as i64,
                cached.trust_level.as_str(),
                cached.total_attempts,
                cached.successful_attempts,
                cached.last_success_ms.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    /// Fetch and unseal a cached connection.
    pub fn get_cached_peer(
        &self,
        peer_id_hash: &str,
    ) -> Result<Option<CachedPeerConnection>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT peer_id_hash, public_key, session_data, last_seen_ms, trust_level, total_attempts, successful_attempts, last_success_ms
                 FROM cached_peer_connections WHERE peer_id_hash = ?1",
                params![peer_id_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((peer, key, session, last_seen, trust, total, successful, last_success)) = row
        else {
            return Ok(None);
        };
        drop(conn);
        Ok(Some(CachedPeerConnection {
            peer_id_hash: peer,
            public_key: self
                .crypter
                .decrypt_string("cached_peer_connections.public_key", &key)?,
            session_data: self
                .crypter
                .decrypt_string("cached_peer_connections.session_data", &session)?,
            last_seen_ms: last_seen as u64,
            trust_level: TrustLevel::parse(&trust)
                .ok_or_else(|| StoreError::Corrupt(format!("trust level {trust}")))?,
            total_attempts: total,
            successful_attempts: successful,
            last_success_ms: last_success.map(|v| v as u64),
        }))
    }

    // ---- sync schedules ------------------------------------------------

    /// Insert or replace a verification schedule.
    pub fn upsert_sync_schedule(&self, schedule: &SyncSchedule) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO sync_schedules (backup_id, peer_id_hash, next_sync_ms, interval_ms, last_result)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(backup_id) DO UPDATE SET
               next_sync_ms = excluded.next_sync_ms, interval_ms = excluded.interval_ms,
               last_result = excluded.last_result",
            params![
                schedule.backup_id,
                schedule.peer_id_hash,
                schedule.next_sync_ms as i64,
                schedule.interval_ms as i64,
                schedule.last_result,
            ],
        )?;
        Ok(())
    }

    /// Fetch one backup's schedule.
    pub fn get_sync_schedule(&self, backup_id: &str) -> Result<Option<SyncSchedule>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT backup_id, peer_id_hash, next_sync_ms, interval_ms, last_result
                 FROM sync_schedules WHERE backup_id = ?1",
                params![backup_id],
                |row| {
                    Ok(SyncSchedule {
                        backup_id: row.get(0)?,
                        peer_id_hash: row.get(1)?,
                        next_sync_ms: row.get::<_, i64>(2)? as u64,
                        interval_ms: row.get::<_, i64>(3)? as u64,
                        last_result: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Schedules whose next run is due at or before `now`.
    pub fn due_schedules(&self, now: u64) -> Result<Vec<SyncSchedule>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT backup_id, peer_id_hash, next_sync_ms, interval_ms, last_result
             FROM sync_schedules WHERE next_sync_ms <= ?1 ORDER BY next_sync_ms",
        )?;
        let rows = stmt.query_map(params![now as i64], |row| {
            Ok(SyncSchedule {
                backup_id: row.get(0)?,
                peer_id_hash: row.get(1)?,
                next_sync_ms: row.get::<_, i64>(2)? as u64,
                interval_ms: row.get::<_, i64>(3)? as u64,
                last_result: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- statistics and maintenance ------------------------------------

    /// Aggregate counts used by the UI and reputation collaborators.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock();
        let mut stats = StoreStats::default();

        let mut stmt = conn.prepare(
            "SELECT direction, COUNT(*), COALESCE(SUM(total_bytes), 0) FROM backups GROUP BY direction",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (direction, count, bytes) = row?;
            match Direction::parse(&direction) {
                Some(Direction::Sent) => {
                    stats.sent_backups = count;
                    stats.sent_bytes = bytes as u64;
                }
                Some(Direction::Received) => {
                    stats.received_backups = count;
                    stats.received_bytes = bytes as u64;
                }
                None => {}
            }
        }

        let mut stmt =
            conn.prepare("SELECT trust_level, COUNT(*) FROM peers GROUP BY trust_level")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        for row in rows {
            let (trust, count) = row?;
            stats.peers_by_trust.push((trust, count));
        }

        Ok(stats)
    }

    /// Purge aged rows: year-old challenges, completed transfer sessions,
    /// month-old cached peers, week-old settled chunk states.
    pub fn run_maintenance(&self, now: u64) -> Result<MaintenanceReport, StoreError> {
        let conn = self.lock();
        let mut report = MaintenanceReport::default();

        report.challenges_purged = conn.execute(
            "DELETE FROM verification_challenges WHERE issued_ms < ?1",
            params![now.saturating_sub(CHALLENGE_RETENTION_MS) as i64],
        )?;
        report.sessions_purged = conn.execute(
            "DELETE FROM transfer_sessions WHERE status = 'completed'",
            [],
        )?;
        report.cached_peers_purged = conn.execute(
            "DELETE FROM cached_peer_connections WHERE last_seen_ms < ?1",
            params![now.saturating_sub(CACHED_PEER_RETENTION_MS) as i64],
        )?;
        report.chunk_states_purged = conn.execute(
            "DELETE FROM transfer_chunk_states
             WHERE state IN ('completed', 'verified') AND last_attempt_ms < ?1",
            params![now.saturating_sub(CHUNK_STATE_RETENTION_MS) as i64],
        )?;

        tracing::debug!(?report, "store maintenance pass");
        Ok(report)
    }
}

type BackupRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    u32,
    i64,
    String,
);

fn map_backup_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<BackupRecord, StoreError>> {
    let raw: BackupRow = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    );
    Ok(build_backup(raw))
}

fn build_backup(raw: BackupRow) -> Result<BackupRecord, StoreError> {
    let (id, name, direction, peer, created, status, file_count, total_bytes, metadata) = raw;
    Ok(BackupRecord {
        id,
        name,
        direction: Direction::parse(&direction)
            .ok_or_else(|| StoreError::Corrupt(format!("direction {direction}")))?,
        peer_id_hash: peer,
        created_at_ms: created as u64,
        status: BackupStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {status}")))?,
        file_count,
        total_bytes: total_bytes as u64,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| StoreError::Corrupt(format!("backup metadata: {e}")))?,
    })
}

fn read_or_create_salt(conn: &Connection) -> Result<[u8; SALT_LEN], StoreError> {
    let existing: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'field_salt'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(bytes) = existing {
        return bytes
            .try_into()
            .map_err(|_| StoreError::Schema("field salt has wrong length".into()));
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('field_salt', ?1)",
        params![salt.to_vec()],
    )?;
    Ok(salt)
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS store_meta (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS backups (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    direction     TEXT NOT NULL,
    peer_id_hash  TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    status        TEXT NOT NULL,
    file_count    INTEGER NOT NULL,
    total_bytes   INTEGER NOT NULL,
    metadata      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backups_peer ON backups(peer_id_hash);
CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);
CREATE TABLE IF NOT EXISTS backup_files (
    backup_id   TEXT NOT NULL,
    path        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    hash        TEXT NOT NULL,
    chunk_count INTEGER NOT NULL,
    status      TEXT NOT NULL,
    PRIMARY KEY (backup_id, path)
);
CREATE INDEX IF NOT EXISTS idx_backup_files_backup ON backup_files(backup_id);
CREATE TABLE IF NOT EXISTS peers (
    peer_id_hash  TEXT PRIMARY KEY,
    public_key    BLOB NOT NULL,
    trust_level   TEXT NOT NULL,
    metadata      BLOB,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_peers_trust ON peers(trust_level);
CREATE TABLE IF NOT EXISTS storage_commitments (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_id_hash          TEXT NOT NULL,
    encryption_public_key TEXT NOT NULL,
    bytes_offered         INTEGER NOT NULL,
    availability          TEXT NOT NULL,
    retention_ms          INTEGER NOT NULL,
    created_ms            INTEGER NOT NULL,
    expires_ms            INTEGER NOT NULL,
    signature             BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_commitments_peer ON storage_commitments(peer_id_hash);
CREATE INDEX IF NOT EXISTS idx_commitments_expiry ON storage_commitments(expires_ms);
CREATE TABLE IF NOT EXISTS verification_challenges (
    id               TEXT PRIMARY KEY,
    backup_id        TEXT NOT NULL,
    peer_id_hash     TEXT NOT NULL,
    kind             TEXT NOT NULL,
    challenge_data   BLOB NOT NULL,
    response_data    BLOB,
    status           TEXT NOT NULL,
    issued_ms        INTEGER NOT NULL,
    expires_ms       INTEGER NOT NULL,
    response_time_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_challenges_peer ON verification_challenges(peer_id_hash);
CREATE INDEX IF NOT EXISTS idx_challenges_backup ON verification_challenges(backup_id);
CREATE INDEX IF NOT EXISTS idx_challenges_issued ON verification_challenges(issued_ms);
CREATE TABLE IF NOT EXISTS transfer_sessions (
    id           TEXT PRIMARY KEY,
    backup_id    TEXT NOT NULL,
    peer_id_hash TEXT NOT NULL,
    direction    TEXT NOT NULL,
    status       TEXT NOT NULL,
    started_ms   INTEGER NOT NULL,
    updated_ms   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_backup ON transfer_sessions(backup_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON transfer_sessions(status);
CREATE TABLE IF NOT EXISTS cached_peer_connections (
    peer_id_hash        TEXT PRIMARY KEY,
    public_key          BLOB NOT NULL,
    session_data        BLOB NOT NULL,
    last_seen_ms        INTEGER NOT NULL,
    trust_level         TEXT NOT NULL,
    total_attempts      INTEGER NOT NULL,
    successful_attempts INTEGER NOT NULL,
    last_success_ms     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_cached_last_seen ON cached_peer_connections(last_seen_ms);
CREATE TABLE IF NOT EXISTS transfer_chunk_states (
    backup_id       TEXT NOT NULL,
    chunk_index     INTEGER NOT NULL,
    chunk_hash      TEXT NOT NULL,
    chunk_size      INTEGER NOT NULL,
    state           TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL,
    last_attempt_ms INTEGER NOT NULL,
    error           TEXT,
    PRIMARY KEY (backup_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunk_states_state ON transfer_chunk_states(backup_id, state);
CREATE TABLE IF NOT EXISTS sync_schedules (
    backup_id    TEXT PRIMARY KEY,
    peer_id_hash TEXT NOT NULL,
    next_sync_ms INTEGER NOT NULL,
    interval_ms  INTEGER NOT NULL,
    last_result  TEXT
);
CREATE INDEX IF NOT EXISTS idx_schedules_next ON sync_schedules(next_sync_ms);
";
