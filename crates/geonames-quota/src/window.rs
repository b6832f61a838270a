//! Fixed time windows and their request counters
//!
//! Each window is a bucket aligned to the Unix epoch (UTC). A counter
//! remembers which bucket it was counting for; the first access after that
//! bucket has passed resets it. There is no background sweep.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Length of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Second,
    Minute,
    Hour,
    Day,
}

impl Window {
    /// Every window, shortest first.
    pub const ALL: [Window; 4] = [Window::Second, Window::Minute, Window::Hour, Window::Day];

    pub fn length(self) -> Duration {
        Duration::from_millis(self.length_millis())
    }

    pub fn length_millis(self) -> u64 {
        match self {
            Window::Second => 1_000,
            Window::Minute => 60_000,
            Window::Hour => 3_600_000,
            Window::Day => 86_400_000,
        }
    }

    /// Start of the bucket containing `now_millis`.
    pub fn bucket_start(self, now_millis: u64) -> u64 {
        now_millis - now_millis % self.length_millis()
    }

    /// Instant (ms since epoch) at which the bucket containing `now_millis` ends.
    pub fn resets_at(self, now_millis: u64) -> u64 {
        self.bucket_start(now_millis) + self.length_millis()
    }

    /// Time remaining in the bucket containing `now_millis`.
    pub fn resets_in(self, now_millis: u64) -> Duration {
        Duration::from_millis(self.resets_at(now_millis) - now_millis)
    }

    pub fn label(self) -> &'static str {
        match self {
            Window::Second => "second",
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Window::Second => 0,
            Window::Minute => 1,
            Window::Hour => 2,
            Window::Day => 3,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Request count for one window of one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    window: Window,
    bucket_start: u64,
    count: u64,
}

impl UsageWindow {
    pub fn new(window: Window, now_millis: u64) -> Self {
        Self {
            window,
            bucket_start: window.bucket_start(now_millis),
            count: 0,
        }
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Reset the counter if `now_millis` falls in a later bucket.
    ///
    /// A clock that moved backwards keeps the current count: forgetting
    /// usage would let requests through that the provider already counted.
    pub fn roll(&mut self, now_millis: u64) {
        let current = self.window.bucket_start(now_millis);
        if current > self.bucket_start {
            self.bucket_start = current;
            self.count = 0;
        }
    }

    /// Whether `at_millis` falls in the bucket this counter is counting.
    pub fn covers(&self, at_millis: u64) -> bool {
        self.window.bucket_start(at_millis) == self.bucket_start
    }

    pub fn increment(&mut self) {
        self.count += 1;
    }

    /// Undo one increment. Returns false when there was nothing to undo.
    pub fn decrement(&mut self) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }

    /// Instant (ms since epoch) at which this counter's bucket ends.
    pub fn resets_at(&self) -> u64 {
        self.bucket_start + self.window.length_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_aligns_to_window_length() {
        assert_eq!(Window::Minute.bucket_start(125_000), 120_000);
        assert_eq!(Window::Hour.bucket_start(3_600_001), 3_600_000);
        assert_eq!(Window::Second.bucket_start(999), 0);
    }

    #[test]
    fn resets_in_counts_down_to_boundary() {
        assert_eq!(Window::Minute.resets_in(125_000), Duration::from_secs(55));
        assert_eq!(Window::Minute.resets_in(120_000), Duration::from_secs(60));
    }

    #[test]
    fn roll_resets_on_new_bucket() {
        let mut w = UsageWindow::new(Window::Minute, 60_000);
        w.increment();
        w.increment();
        w.roll(119_999);
        assert_eq!(w.count(), 2);
        w.roll(120_000);
        assert_eq!(w.count(), 0);
        assert_eq!(w.resets_at(), 180_000);
    }

    #[test]
    fn roll_ignores_clock_going_backwards() {
        let mut w = UsageWindow::new(Window::Minute, 600_000);
        w.increment();
        w.roll(10_000);
        assert_eq!(w.count(), 1);
    }

    #[test]
    fn decrement_stops_at_zero() {
        let mut w = UsageWindow::new(Window::Hour, 0);
        assert!(!w.decrement());
        w.increment();
        assert!(w.decrement());
        assert_eq!(w.count(), 0);
    }

    #[test]
    fn covers_only_same_bucket() {
        let w = UsageWindow::new(Window::Minute, 61_000);
        assert!(w.covers(60_000));
        assert!(w.covers(119_999));
        assert!(!w.covers(120_000));
    }

    #[test]
    fn window_serializes_lowercase() {
        let json = serde_json::to_string(&Window::Hour).unwrap();
        assert_eq!(json, "\"hour\"");
    }
}
