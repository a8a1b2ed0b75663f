//! Sliding-window admission control per peer.
//!
//! Two windows guard every peer: a coarse one (100 requests / 60 s by
//! default) and a burst one (20 requests / 1 s). Known message types carry
//! their own caps that replace the coarse check. Denials never mutate the
//! window counters; repeated denials at high utilization escalate to a
//! temporary ban, during which everything from the peer is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;
use crate::events::{EventSender, PeerEvent};

/// Per-type caps over the coarse window, protocol defaults.
const TYPE_CAPS: &[(&str, u32)] = &[
    ("file_chunk", 200),
    ("ping", 60),
    ("storage_challenge", 10),
    ("peer_identity", 5),
    ("file_start", 20),
];

fn type_cap(message_type: &str) -> Option<u32> {
    TYPE_CAPS
        .iter()
        .find(|(name, _)| *name == message_type)
        .map(|(_, cap)| *cap)
}

struct PeerWindow {
    coarse: VecDeque<Instant>,
    burst: VecDeque<Instant>,
    by_type: HashMap<String, VecDeque<Instant>>,
    banned_until: Option<Instant>,
    strikes: u32,
    last_activity: Instant,
}

impl PeerWindow {
    fn new(now: Instant) -> Self {
        Self {
            coarse: VecDeque::new(),
            burst: VecDeque::new(),
            by_type: HashMap::new(),
            banned_until: None,
            strikes: 0,
            last_activity: now,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration, burst_window: Duration) {
        prune_deque(&mut self.coarse, now, window);
        prune_deque(&mut self.burst, now, burst_window);
        for deque in self.by_type.values_mut() {
            prune_deque(deque, now, window);
        }
    }
}

fn prune_deque(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = deque.front() {
        if now.duration_since(*front) >= window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

struct LimiterInner {
    peers: HashMap<String, PeerWindow>,
    last_gc: Instant,
}

/// Dual-window rate limiter with per-type caps and temporary bans.
pub struct RateLimiter {
    config: RateLimitConfig,
    events: EventSender,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            inner: Mutex::new(LimiterInner {
                peers: HashMap::new(),
                last_gc: Instant::now(),
            }),
        }
    }

    /// Admit or deny one message from `peer_id_hash`.
    pub fn check(&self, peer_id_hash: &str, message_type: &str) -> Result<(), RateLimitError> {
        self.check_at(peer_id_hash, message_type, Instant::now())
    }

    /// Admission decision at an explicit instant. Exposed for tests.
    pub fn check_at(
        &self,
        peer_id_hash: &str,
        message_type: &str,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        let window = Duration::from_secs(self.config.window_secs);
        let burst_window = Duration::from_millis(self.config.burst_ms);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if now.duration_since(inner.last_gc) >= window / 2 {
            inner.last_gc = now;
            inner.peers.retain(|_, record| {
                record.banned_until.is_some_and(|until| until > now)
                    || now.duration_since(record.last_activity) < window
            });
        }

        let record = inner
            .peers
            .entry(peer_id_hash.to_string())
            .or_insert_with(|| PeerWindow::new(now));
        record.last_activity = now;

        if let Some(until) = record.banned_until {
            if until > now {
                return Err(RateLimitError::Banned);
            }
            record.banned_until = None;
            record.strikes = 0;
        }

        record.prune(now, window, burst_window);

        let denial = if record.burst.len() >= self.config.burst_max as usize {
            Some(RateLimitError::Burst)
        } else if let Some(cap) = type_cap(message_type) {
            let count = record
                .by_type
                .get(message_type)
                .map(|d| d.len())
                .unwrap_or(0);
            (count >= cap as usize).then_some(RateLimitError::MessageType)
        } else if record.coarse.len() >= self.config.window_max as usize {
            Some(RateLimitError::Window)
        } else {
            None
        };

        if let Some(reason) = denial {
            let coarse_util = record.coarse.len() as f64 / self.config.window_max as f64;
            let burst_util = record.burst.len() as f64 / self.config.burst_max as f64;
            if coarse_util > self.config.window_ban_threshold
                || burst_util > self.config.burst_ban_threshold
            {
                record.strikes += 1;
                if record.strikes >= self.config.ban_strikes {
                    let ban = Duration::from_secs(self.config.ban_secs);
                    record.banned_until = Some(now + ban);
                    record.strikes = 0;
                    let until_ms =
                        crate::crypto::identity::now_ms() + self.config.ban_secs * 1000;
                    tracing::warn!(peer = %peer_id_hash, "rate limit ban");
                    self.events.emit(PeerEvent::PeerBanned {
                        peer_id_hash: peer_id_hash.to_string(),
                        until_ms,
                    });
                }
            }
            return Err(reason);
        }

        record.strikes = 0;
        record.coarse.push_back(now);
        record.burst.push_back(now);
        record
            .by_type
            .entry(message_type.to_string())
            .or_default()
            .push_back(now);
        Ok(())
    }

    /// Whether the peer is currently banned.
    pub fn is_banned(&self, peer_id_hash: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .peers
            .get(peer_id_hash)
            .and_then(|r| r.banned_until)
            .is_some_and(|until| until > Instant::now())
    }

    /// Number of peers with live window state.
    pub fn tracked_peers(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default(), EventSender::disconnected())
    }

    /// Admissions spaced to dodge the burst window.
    fn spaced(start: Instant, i: u64) -> Instant {
        start + Duration::from_millis(i * 55)
    }

    #[test]
    fn test_exact_cap_passes_one_more_denied() {
        let limiter = limiter();
        let start = Instant::now();

        for i in 0..100u64 {
            limiter.check_at("p", "unknown_kind", spaced(start, i)).unwrap();
        }
        assert_eq!(
            limiter.check_at("p", "unknown_kind", spaced(start, 100)),
            Err(RateLimitError::Window)
        );

        // After the window has fully elapsed, the peer may speak again.
        let later = spaced(start, 100) + Duration::from_secs(61);
        assert!(limiter.check_at("p", "unknown_kind", later).is_ok());
    }

    #[test]
    fn test_burst_window_trips_first() {
        let limiter = limiter();
        let start = Instant::now();
        for i in 0..20u64 {
            limiter
                .check_at("p", "ping", start + Duration::from_millis(i))
                .unwrap();
        }
        assert_eq!(
            limiter.check_at("p", "ping", start + Duration::from_millis(30)),
            Err(RateLimitError::Burst)
        );
    }

    #[test]
    fn test_message_type_cap_overrides_coarse() {
        let limiter = limiter();
        let start = Instant::now();

        // file_chunk allows 200/60 s even though the coarse window is 100.
        for i in 0..200u64 {
            limiter
                .check_at("p", "file_chunk", start + Duration::from_millis(i * 60))
                .unwrap();
        }
        assert_eq!(
            limiter.check_at("p", "file_chunk", start + Duration::from_millis(200 * 60)),
            Err(RateLimitError::MessageType)
        );
    }

    #[test]
    fn test_denial_does_not_consume_budget() {
        let limiter = limiter();
        let start = Instant::now();
        for i in 0..5u64 {
            limiter.check_at("p", "peer_identity", spaced(start, i)).unwrap();
        }
        // Denials leave the counters alone, so the same answer repeats.
        for i in 5..8u64 {
            assert_eq!(
                limiter.check_at("p", "peer_identity", spaced(start, i)),
                Err(RateLimitError::MessageType)
            );
        }
        // Once the first admission ages out, one slot opens again.
        let later = spaced(start, 0) + Duration::from_secs(61);
        assert!(limiter.check_at("p", "peer_identity", later).is_ok());
    }

    #[test]
    fn test_repeated_overload_bans_then_drops() {
        let limiter = limiter();
        let start = Instant::now();

        for i in 0..200u64 {
            limiter
                .check_at("p", "file_chunk", start + Duration::from_millis(i * 60))
                .unwrap();
        }

        // Coarse utilization is far past 90%; three denials earn a ban.
        let mut t = start + Duration::from_millis(200 * 60);
        for _ in 0..3 {
            assert_eq!(
                limiter.check_at("p", "file_chunk", t),
                Err(RateLimitError::MessageType)
            );
            t += Duration::from_millis(10);
        }

        assert_eq!(
            limiter.check_at("p", "file_chunk", t),
            Err(RateLimitError::Banned)
        );
        // Even an innocuous kind is dropped during the ban.
        assert_eq!(
            limiter.check_at("p", "pong", t),
            Err(RateLimitError::Banned)
        );

        // Bans outlast the window; five minutes later the peer recovers.
        let after_ban = t + Duration::from_secs(301);
        assert!(limiter.check_at("p", "file_chunk", after_ban).is_ok());
    }

    #[test]
    fn test_peers_are_isolated() {
        let limiter = limiter();
        let start = Instant::now();
        for i in 0..100u64 {
            limiter.check_at("a", "unknown_kind", spaced(start, i)).unwrap();
        }
        assert!(limiter
            .check_at("b", "unknown_kind", spaced(start, 100))
            .is_ok());
    }

    #[test]
    fn test_stale_records_collected() {
        let limiter = limiter();
        let start = Instant::now();
        limiter.check_at("a", "ping", start).unwrap();
        assert_eq!(limiter.tracked_peers(), 1);

        // A later check from another peer triggers the half-window GC.
        limiter
            .check_at("b", "ping", start + Duration::from_secs(120))
            .unwrap();
        assert_eq!(limiter.tracked_peers(), 1);
    }
}
