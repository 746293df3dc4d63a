//! Per-peer failure suppressors.
//!
//! One map, two windows: a 5-second window deduplicates concurrent
//! eviction work after delivery failures, and a 5-minute window stops
//! repeated whoami probing of a peer that already failed discovery.
//! Not persisted.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use cyberchat_shared::constants::{DISCOVERY_COOLDOWN, EVICTION_COOLDOWN};

#[derive(Default)]
pub struct FailureCooldown {
    inner: Mutex<HashMap<Uuid, Instant>>,
}

impl FailureCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the eviction work for a failed peer. Returns false when
    /// another failure already claimed it within the window.
    pub fn begin_eviction(&self, guid: Uuid) -> bool {
        let mut map = self.inner.lock();
        let now = Instant::now();
        match map.get(&guid) {
            Some(at) if now.duration_since(*at) < EVICTION_COOLDOWN => false,
            _ => {
                map.insert(guid, now);
                true
            }
        }
    }

    /// Whether opportunistic discovery for this peer is suppressed.
    /// Expired entries are cleared on the way out.
    pub fn in_discovery_cooldown(&self, guid: Uuid) -> bool {
        let mut map = self.inner.lock();
        match map.get(&guid) {
            Some(at) if at.elapsed() < DISCOVERY_COOLDOWN => true,
            Some(_) => {
                map.remove(&guid);
                false
            }
            None => false,
        }
    }

    /// Record a discovery failure.
    pub fn mark(&self, guid: Uuid) {
        self.inner.lock().insert(guid, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_claimed_once() {
        let cooldown = FailureCooldown::new();
        let guid = Uuid::new_v4();

        assert!(cooldown.begin_eviction(guid));
        // A concurrent failure within the window is suppressed.
        assert!(!cooldown.begin_eviction(guid));

        // Other peers are unaffected.
        assert!(cooldown.begin_eviction(Uuid::new_v4()));
    }

    #[test]
    fn test_discovery_cooldown() {
        let cooldown = FailureCooldown::new();
        let guid = Uuid::new_v4();

        assert!(!cooldown.in_discovery_cooldown(guid));
        cooldown.mark(guid);
        assert!(cooldown.in_discovery_cooldown(guid));
    }
}
