//! Per-peer exponential backoff
//!
//! The n-th consecutive failure schedules the next attempt `base * 2^(n-1)`
//! later, capped at `max`. A success clears the entry.

use libp2p::PeerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    failures: u32,
    retry_at: Instant,
}

#[derive(Debug, Clone)]
pub struct BackoffTracker {
    base: Duration,
    max: Duration,
    entries: HashMap<PeerId, BackoffEntry>,
}

impl BackoffTracker {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            entries: HashMap::new(),
        }
    }

    /// Apply new bounds; already scheduled retries keep their time
    pub fn set_bounds(&mut self, base: Duration, max: Duration) {
        self.base = base;
        self.max = max;
    }

    /// Delay for the given number of consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Count a failure and return the delay before the next attempt
    pub fn record_failure(&mut self, peer: PeerId) -> Duration {
        self.record_failure_at(peer, Instant::now())
    }

    pub(crate) fn record_failure_at(&mut self, peer: PeerId, now: Instant) -> Duration {
        let failures = self.entries.get(&peer).map(|e| e.failures).unwrap_or(0) + 1;
        let delay = self.delay_for(failures);
        self.entries.insert(
            peer,
            BackoffEntry {
                failures,
                retry_at: now + delay,
            },
        );
        delay
    }

    pub fn record_success(&mut self, peer: &PeerId) {
        self.entries.remove(peer);
    }

    /// Current backoff delay for a peer; zero when it has not failed
    pub fn get_backoff_time(&self, peer: &PeerId) -> Duration {
        self.delay_for(self.failures(peer))
    }

    pub fn failures(&self, peer: &PeerId) -> u32 {
        self.entries.get(peer).map(|e| e.failures).unwrap_or(0)
    }

    /// Whether the peer must not be contacted yet
    pub fn in_backoff(&self, peer: &PeerId) -> bool {
        self.in_backoff_at(peer, Instant::now())
    }

    pub(crate) fn in_backoff_at(&self, peer: &PeerId, now: Instant) -> bool {
        self.entries
            .get(peer)
            .map(|e| now < e.retry_at)
            .unwrap_or(false)
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.entries.remove(peer);
    }
}
