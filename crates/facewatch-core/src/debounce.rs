//! Per-target suppression of repeated matches.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default suppression window after a recorded match.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Tracks when each target last produced a record.
///
/// The window is measured from the last time [`arm`](Self::arm) was called for
/// a target, so a match that was suppressed never extends the window.
#[derive(Debug, Clone)]
pub struct Cooldown {
    window: Duration,
    last_fired: HashMap<String, Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: HashMap::new(),
        }
    }

    /// Whether a match for `key` at `now` may produce a record.
    pub fn ready(&self, key: &str, now: Instant) -> bool {
        match self.last_fired.get(key) {
            Some(&last) => now.saturating_duration_since(last) >= self.window,
            None => true,
        }
    }

    /// Start a new window for `key`.
    pub fn arm(&mut self, key: &str, now: Instant) {
        self.last_fired.insert(key.to_string(), now);
    }

    /// Time left before `key` may fire again.
    pub fn remaining(&self, key: &str, now: Instant) -> Duration {
        self.last_fired
            .get(key)
            .map(|&last| self.window.saturating_sub(now.saturating_duration_since(last)))
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for Cooldown {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_is_ready() {
        let c = Cooldown::default();
        assert!(c.ready("1", Instant::now()));
    }

    #[test]
    fn test_suppressed_inside_window() {
        let mut c = Cooldown::new(Duration::from_secs(5));
        let t0 = Instant::now();
        c.arm("1", t0);
        assert!(!c.ready("1", t0 + Duration::from_millis(4_999)));
        assert!(c.ready("1", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_targets_are_independent() {
        let mut c = Cooldown::new(Duration::from_secs(5));
        let t0 = Instant::now();
        c.arm("1", t0);
        assert!(c.ready("2", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_remaining() {
        let mut c = Cooldown::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert_eq!(c.remaining("1", t0), Duration::ZERO);
        c.arm("1", t0);
        assert_eq!(c.remaining("1", t0 + Duration::from_secs(2)), Duration::from_secs(3));
        assert_eq!(c.remaining("1", t0 + Duration::from_secs(9)), Duration::ZERO);
    }
}
