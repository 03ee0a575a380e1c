//! [`Watchdog`] – per-port cycle heartbeat monitor.
//!
//! Every port scheduler calls [`Watchdog::heartbeat`] once per completed
//! sample/event cycle.  The watchdog remembers when that happened and
//! considers a port *stalled* once its deadline has passed without a new
//! cycle, which is what a blocked read on a hung bus looks like from the
//! outside.
//!
//! Call [`Watchdog::stalled`] from a supervisor loop to obtain the ports that
//! need attention.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Liveness reported for a single port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// A cycle completed within the deadline.
    Alive,
    /// No cycle completed within the deadline.
    Stalled,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct PortEntry {
    last_beat: Instant,
    last_cycle_at: Option<DateTime<Utc>>,
    deadline: Duration,
    cycles: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks cycle heartbeats from port schedulers and detects stalled ports.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use buspoll_kernel::watchdog::{Liveness, Watchdog};
///
/// let mut wd = Watchdog::new();
/// wd.register("/dev/ttyUSB0", Duration::from_secs(5));
/// wd.heartbeat("/dev/ttyUSB0");
///
/// assert_eq!(wd.liveness("/dev/ttyUSB0"), Liveness::Alive);
/// assert_eq!(wd.cycles("/dev/ttyUSB0"), 1);
/// ```
#[derive(Default)]
pub struct Watchdog {
    ports: HashMap<String, PortEntry>,
}

impl Watchdog {
    /// Create an empty watchdog with no registered ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `port` with a maximum gap of `deadline` between cycles.
    ///
    /// The deadline starts counting now.  Re-registering a port (e.g. after a
    /// scheduler restart) resets its deadline but keeps its cycle count and
    /// last cycle time.
    pub fn register(&mut self, port: &str, deadline: Duration) {
        let entry = self.ports.entry(port.to_string()).or_insert(PortEntry {
            last_beat: Instant::now(),
            last_cycle_at: None,
            deadline,
            cycles: 0,
        });
        entry.last_beat = Instant::now();
        entry.deadline = deadline;
    }

    /// Record a completed cycle for `port`.
    ///
    /// No-ops for ports that have not been registered.
    pub fn heartbeat(&mut self, port: &str) {
        if let Some(entry) = self.ports.get_mut(port) {
            entry.last_beat = Instant::now();
            entry.last_cycle_at = Some(Utc::now());
            entry.cycles += 1;
        }
    }

    /// Return the [`Liveness`] of `port`.  Unknown ports are
    /// [`Liveness::Stalled`].
    pub fn liveness(&self, port: &str) -> Liveness {
        match self.ports.get(port) {
            Some(entry) if entry.last_beat.elapsed() <= entry.deadline => Liveness::Alive,
            _ => Liveness::Stalled,
        }
    }

    /// Ports whose deadline has been exceeded, sorted by name.
    pub fn stalled(&self) -> Vec<String> {
        let mut stalled: Vec<String> = self
            .ports
            .iter()
            .filter(|(_, entry)| entry.last_beat.elapsed() > entry.deadline)
            .map(|(port, _)| port.clone())
            .collect();
        stalled.sort();
        stalled
    }

    /// Number of completed cycles for `port` (0 if unknown).
    pub fn cycles(&self, port: &str) -> u64 {
        self.ports.get(port).map_or(0, |e| e.cycles)
    }

    /// Wall-clock time of the last completed cycle.
    pub fn last_cycle_at(&self, port: &str) -> Option<DateTime<Utc>> {
        self.ports.get(port).and_then(|e| e.last_cycle_at)
    }
}
