//! [`FailureGuard`] – consecutive read-failure counter.
//!
//! Tracks two streaks per widget:
//!
//! - the *failure* streak counts every failed read in a row, whatever its
//!   class, and feeds the status board;
//! - the *protocol* streak counts protocol errors in a row and is the only
//!   one that escalates.  Any other outcome, a transient error included,
//!   clears it.
//!
//! A successful read clears both.
//!
//! # Example
//!
//! ```rust
//! use buspoll_runtime::failure_guard::FailureGuard;
//! use buspoll_types::{ErrorClass, WidgetId};
//!
//! let mut guard = FailureGuard::new(3);
//! let w = WidgetId::new();
//!
//! guard.record_failure(w, ErrorClass::Protocol);
//! guard.record_failure(w, ErrorClass::Protocol);
//! assert!(!guard.is_exhausted(w));
//! guard.record_failure(w, ErrorClass::Transient); // link hiccup breaks the run
//! guard.record_failure(w, ErrorClass::Protocol);
//! assert_eq!(guard.streak(w), 4);
//! assert_eq!(guard.protocol_streak(w), 1);
//!
//! guard.record_success(w);
//! assert_eq!(guard.streak(w), 0);
//! ```

use std::collections::HashMap;

use buspoll_types::{ErrorClass, WidgetId};

#[derive(Default, Clone, Copy)]
struct Streaks {
    failures: u32,
    protocol: u32,
}

/// Per-widget streaks of consecutive failed reads.
pub struct FailureGuard {
    /// Protocol streak that counts as exhausted; `0` disables escalation.
    threshold: u32,
    streaks: HashMap<WidgetId, Streaks>,
}

impl FailureGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            streaks: HashMap::new(),
        }
    }

    /// Record a failed read of `class` and return the widget's new failure
    /// streak.
    pub fn record_failure(&mut self, widget: WidgetId, class: ErrorClass) -> u32 {
        let streaks = self.streaks.entry(widget).or_default();
        streaks.failures = streaks.failures.saturating_add(1);
        streaks.protocol = match class {
            ErrorClass::Protocol => streaks.protocol.saturating_add(1),
            ErrorClass::Transient | ErrorClass::Fatal => 0,
        };
        streaks.failures
    }

    /// Record a successful read, clearing both streaks.
    pub fn record_success(&mut self, widget: WidgetId) {
        self.streaks.remove(&widget);
    }

    /// Consecutive failed reads of any class.
    pub fn streak(&self, widget: WidgetId) -> u32 {
        self.streaks.get(&widget).map_or(0, |s| s.failures)
    }

    /// Consecutive protocol errors.
    pub fn protocol_streak(&self, widget: WidgetId) -> u32 {
        self.streaks.get(&widget).map_or(0, |s| s.protocol)
    }

    /// `true` once the widget's protocol streak has reached the threshold.
    pub fn is_exhausted(&self, widget: WidgetId) -> bool {
        self.threshold > 0 && self.protocol_streak(widget) >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_grows_until_success() {
        let mut guard = FailureGuard::new(5);
        let w = WidgetId::new();
        assert_eq!(guard.record_failure(w, ErrorClass::Transient), 1);
        assert_eq!(guard.record_failure(w, ErrorClass::Protocol), 2);
        guard.record_success(w);
        assert_eq!(guard.streak(w), 0);
        assert_eq!(guard.protocol_streak(w), 0);
        assert_eq!(guard.record_failure(w, ErrorClass::Transient), 1);
    }

    #[test]
    fn exhausted_at_threshold() {
        let mut guard = FailureGuard::new(2);
        let w = WidgetId::new();
        guard.record_failure(w, ErrorClass::Protocol);
        assert!(!guard.is_exhausted(w));
        guard.record_failure(w, ErrorClass::Protocol);
        assert!(guard.is_exhausted(w));
        guard.record_failure(w, ErrorClass::Protocol);
        assert!(guard.is_exhausted(w)); // stays exhausted
    }

    #[test]
    fn transient_errors_never_exhaust() {
        let mut guard = FailureGuard::new(2);
        let w = WidgetId::new();
        for _ in 0..10 {
            guard.record_failure(w, ErrorClass::Transient);
        }
        assert_eq!(guard.streak(w), 10);
        assert!(!guard.is_exhausted(w));
    }

    #[test]
    fn transient_error_breaks_a_protocol_run() {
        let mut guard = FailureGuard::new(3);
        let w = WidgetId::new();
        guard.record_failure(w, ErrorClass::Protocol);
        guard.record_failure(w, ErrorClass::Protocol);
        guard.record_failure(w, ErrorClass::Transient);
        guard.record_failure(w, ErrorClass::Protocol);
        assert_eq!(guard.protocol_streak(w), 1);
        assert!(!guard.is_exhausted(w));
    }

    #[test]
    fn widgets_are_tracked_independently() {
        let mut guard = FailureGuard::new(2);
        let a = WidgetId::new();
        let b = WidgetId::new();
        guard.record_failure(a, ErrorClass::Protocol);
        guard.record_failure(a, ErrorClass::Protocol);
        guard.record_failure(b, ErrorClass::Protocol);
        assert!(guard.is_exhausted(a));
        assert!(!guard.is_exhausted(b));
    }

    #[test]
    fn zero_threshold_never_exhausts() {
        let mut guard = FailureGuard::new(0);
        let w = WidgetId::new();
        for _ in 0..100 {
            guard.record_failure(w, ErrorClass::Protocol);
        }
        assert!(!guard.is_exhausted(w));
    }
}
