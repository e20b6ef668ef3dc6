//! Forced-redirect loop detection.

use std::collections::VecDeque;
use std::time::Duration;

use time::OffsetDateTime;

pub const DEFAULT_LOOP_THRESHOLD: usize = 3;
pub const DEFAULT_LOOP_WINDOW: Duration = Duration::from_secs(10);

/// One forced redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRecord {
    pub path: String,
    pub timestamp: OffsetDateTime,
}

/// Remembers recent forced redirects and declares a loop when one path
/// recurs `threshold` times inside `window`.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    threshold: usize,
    window: Duration,
    history: VecDeque<RedirectRecord>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_THRESHOLD, DEFAULT_LOOP_WINDOW)
    }
}

impl LoopDetector {
    /// A threshold below 2 would flag every single redirect, so it is raised
    /// to 2.
    #[must_use]
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(2),
            window,
            history: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    pub fn record_redirect(&mut self, path: &str) {
        self.record_redirect_at(path, OffsetDateTime::now_utc());
    }

    pub fn record_redirect_at(&mut self, path: &str, at: OffsetDateTime) {
        self.history.push_back(RedirectRecord {
            path: path.to_owned(),
            timestamp: at,
        });
        self.prune(at);
    }

    #[must_use]
    pub fn is_loop_detected(&self) -> bool {
        self.is_loop_detected_at(OffsetDateTime::now_utc())
    }

    /// Counts only records inside the window ending at `now`, so a stale
    /// history never triggers even before the next prune.
    #[must_use]
    pub fn is_loop_detected_at(&self, now: OffsetDateTime) -> bool {
        let recent: Vec<&RedirectRecord> = self
            .history
            .iter()
            .filter(|r| now - r.timestamp <= self.window)
            .collect();
        recent
            .iter()
            .any(|r| recent.iter().filter(|o| o.path == r.path).count() >= self.threshold)
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Retained records, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &RedirectRecord> {
        self.history.iter()
    }

    fn prune(&mut self, now: OffsetDateTime) {
        while let Some(front) = self.history.front() {
            if now - front.timestamp > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2026-03-01 12:00:00 UTC);

    fn secs(n: i64) -> OffsetDateTime {
        T0 + time::Duration::seconds(n)
    }

    #[test]
    fn threshold_redirects_to_same_path_is_a_loop() {
        let mut d = LoopDetector::default();
        d.record_redirect_at("/login", secs(0));
        d.record_redirect_at("/login", secs(1));
        assert!(!d.is_loop_detected_at(secs(1)));
        d.record_redirect_at("/login", secs(2));
        assert!(d.is_loop_detected_at(secs(2)));
    }

    #[test]
    fn different_paths_do_not_add_up() {
        let mut d = LoopDetector::default();
        d.record_redirect_at("/login", secs(0));
        d.record_redirect_at("/child/login", secs(1));
        d.record_redirect_at("/dashboard", secs(2));
        d.record_redirect_at("/login", secs(3));
        assert!(!d.is_loop_detected_at(secs(3)));
    }

    #[test]
    fn old_redirects_fall_out_of_the_window() {
        let mut d = LoopDetector::default();
        d.record_redirect_at("/login", secs(0));
        d.record_redirect_at("/login", secs(1));
        d.record_redirect_at("/login", secs(30));
        assert!(!d.is_loop_detected_at(secs(30)));
        assert_eq!(d.history().count(), 1);
    }

    #[test]
    fn detection_expires_without_new_records() {
        let mut d = LoopDetector::default();
        for n in 0..3 {
            d.record_redirect_at("/login", secs(n));
        }
        assert!(d.is_loop_detected_at(secs(3)));
        assert!(!d.is_loop_detected_at(secs(60)));
    }

    #[test]
    fn reset_clears_history() {
        let mut d = LoopDetector::new(2, Duration::from_secs(5));
        d.record_redirect_at("/login", secs(0));
        d.record_redirect_at("/login", secs(1));
        assert!(d.is_loop_detected_at(secs(1)));
        d.reset();
        assert!(!d.is_loop_detected_at(secs(1)));
        assert_eq!(d.history().count(), 0);
    }

    #[test]
    fn threshold_has_a_floor() {
        assert_eq!(LoopDetector::new(0, DEFAULT_LOOP_WINDOW).threshold(), 2);
    }
}
