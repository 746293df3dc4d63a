//! Adaptive scan-interval schedule.
//!
//! Scanning starts aggressive and backs off while the neighbourhood is
//! quiet: after three consecutive scans with no new peers and an
//! unchanged peer count, the interval grows by 1.25x up to the cap.
//! Any change snaps it back to the base interval.

use std::time::Duration;

use cyberchat_shared::constants::{SCAN_BASE_INTERVAL, SCAN_MAX_INTERVAL};

const MAX_CONSECUTIVE_UNCHANGED: u32 = 3;
const GROWTH_FACTOR: f64 = 1.25;

#[derive(Debug)]
pub struct ScanBackoff {
    current: Duration,
    consecutive_unchanged: u32,
    last_peer_count: usize,
}

impl ScanBackoff {
    pub fn new() -> Self {
        Self {
            current: SCAN_BASE_INTERVAL,
            consecutive_unchanged: 0,
            last_peer_count: 0,
        }
    }

    /// Interval to sleep before the next scan.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a finished scan and return the updated interval.
    pub fn on_scan_complete(&mut self, new_peers: usize, peer_count: usize) -> Duration {
        if new_peers == 0 && peer_count == self.last_peer_count {
            self.consecutive_unchanged += 1;
            if self.consecutive_unchanged >= MAX_CONSECUTIVE_UNCHANGED {
                self.current = self.current.mul_f64(GROWTH_FACTOR).min(SCAN_MAX_INTERVAL);
                self.consecutive_unchanged = 0;
            }
        } else {
            self.current = SCAN_BASE_INTERVAL;
            self.consecutive_unchanged = 0;
        }
        self.last_peer_count = peer_count;
        self.current
    }
}

impl Default for ScanBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_after_three_quiet_scans() {
        let mut backoff = ScanBackoff::new();
        assert_eq!(backoff.on_scan_complete(0, 0), SCAN_BASE_INTERVAL);
        assert_eq!(backoff.on_scan_complete(0, 0), SCAN_BASE_INTERVAL);
        assert_eq!(
            backoff.on_scan_complete(0, 0),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_change_resets_to_base() {
        let mut backoff = ScanBackoff::new();
        for _ in 0..3 {
            backoff.on_scan_complete(0, 0);
        }
        assert!(backoff.current() > SCAN_BASE_INTERVAL);

        // One new peer resets the schedule.
        assert_eq!(backoff.on_scan_complete(1, 1), SCAN_BASE_INTERVAL);

        for _ in 0..3 {
            backoff.on_scan_complete(0, 1);
        }
        assert!(backoff.current() > SCAN_BASE_INTERVAL);

        // A changed count (peer evicted) also resets.
        assert_eq!(backoff.on_scan_complete(0, 0), SCAN_BASE_INTERVAL);
    }

    #[test]
    fn test_caps_at_max_interval() {
        let mut backoff = ScanBackoff::new();
        for _ in 0..100 {
            backoff.on_scan_complete(0, 0);
        }
        assert_eq!(backoff.current(), SCAN_MAX_INTERVAL);
    }
}
