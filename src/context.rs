//! The peer's dependency bundle.
//!
//! Every component is constructed once here and handed around explicitly;
//! there are no process-wide singletons. Sessions, the dispatcher, and the
//! background tasks all borrow from the same bundle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::allocation::AllocationLedger;
use crate::config::PeerConfig;
use crate::crypto::{KeyStore, SecretCache};
use crate::error::Result;
use crate::events::{EventSender, PeerEvent};
use crate::limiter::RateLimiter;
use crate::reputation::{ReputationConfig, ReputationEngine};
use crate::store::Store;
use crate::verify::Verifier;

/// Shared handles to every core component.
#[derive(Clone)]
pub struct PeerContext {
    pub config: Arc<PeerConfig>,
    pub keys: Arc<KeyStore>,
    pub secrets: Arc<SecretCache>,
    pub store: Store,
    pub limiter: Arc<RateLimiter>,
    pub ledger: Arc<AllocationLedger>,
    pub reputation: Arc<ReputationEngine>,
    pub verifier: Arc<Verifier>,
    pub events: EventSender,
}

impl PeerContext {
    /// Build the full component graph under the configured home directory,
    /// creating the on-disk layout on first use.
    pub fn initialize(config: PeerConfig, events: EventSender) -> Result<Self> {
        for dir in [
            config.home_dir.clone(),
            config.keys_dir(),
            config.backups_dir(),
            config.received_dir(),
            config.chunks_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(crate::error::StoreError::Io)?;
        }

        let keys = Arc::new(KeyStore::open(&config.keys_dir())?);
        let secrets = Arc::new(SecretCache::new(keys.clone()));
        let store = Store::open(&config.db_path(), &config.store_seed)?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), events.clone()));
        let ledger = Arc::new(AllocationLedger::with_snapshot(
            config.max_offered_bytes,
            &config.allocation_path(),
        )?);
        let reputation = Arc::new(ReputationEngine::with_snapshot(
            ReputationConfig::default(),
            &config.reputation_path(),
        )?);
        let verifier = Arc::new(Verifier::new(
            store.clone(),
            events.clone(),
            reputation.clone(),
            config.received_dir(),
        ));

        Ok(Self {
            config: Arc::new(config),
            keys,
            secrets,
            store,
            limiter,
            ledger,
            reputation,
            verifier,
            events,
        })
    }

    /// Check ledger consistency, reporting violations as events.
    pub fn validate_ledger(&self) {
        for violation in self.ledger.validate() {
            tracing::warn!(%violation, "allocation ledger inconsistency");
            self.events.emit(PeerEvent::AllocationViolation {
                detail: violation,
            });
        }
    }
}

/// Periodic store upkeep: purge aged challenges, finished transfer
/// sessions, stale cached peers, and settled chunk states.
pub fn spawn_maintenance(context: PeerContext, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let now = crate::crypto::identity::now_ms();
            match context.store.run_maintenance(now) {
                Ok(report) => tracing::debug!(?report, "maintenance complete"),
                Err(err) => {
                    context.events.emit(PeerEvent::StoreWarning {
                        detail: format!("maintenance failed: {err}"),
                    });
                }
            }
            context.validate_ledger();
            if let Err(err) = context.reputation.save() {
                tracing::warn!("reputation snapshot failed: {err}");
            }
            if let Err(err) = context.ledger.save() {
                tracing::warn!("allocation snapshot failed: {err}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PeerConfig::default();
        config.home_dir = dir.path().join("home");

        let context = PeerContext::initialize(config, EventSender::disconnected()).unwrap();

        assert!(context.config.keys_dir().join("signing_private.key").exists());
        assert!(context.config.db_path().exists());
        assert!(context.config.chunks_dir().exists());
        assert_eq!(context.keys.peer_id_hash().len(), 16);
    }

    #[test]
    fn test_reinitialize_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PeerConfig::default();
        config.home_dir = dir.path().join("home");

        let first =
            PeerContext::initialize(config.clone(), EventSender::disconnected()).unwrap();
        let hash = first.keys.peer_id_hash().to_string();
        drop(first);

        let second = PeerContext::initialize(config, EventSender::disconnected()).unwrap();
        assert_eq!(second.keys.peer_id_hash(), hash);
    }
}
