//! [`StatusBoard`] – the state a host status surface renders.
//!
//! Port schedulers write to the board as they run; the orchestrator and the
//! host read it.  It holds, per port, the scheduler state and the last
//! successful cycle (via the embedded [`Watchdog`]), and per widget the last
//! value, last error, and current failure streak.
//!
//! [`StatusBoard::snapshot`] returns a plain, serialisable copy so readers
//! never hold the lock while rendering.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use buspoll_types::{PortState, WidgetId};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::watchdog::{Liveness, Watchdog};

struct PortRecord {
    state: PortState,
    last_error: Option<String>,
    restarts: u32,
}

struct WidgetRecord {
    port: String,
    name: String,
    last_value: Option<f64>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

#[derive(Default)]
struct BoardInner {
    watchdog: Watchdog,
    ports: BTreeMap<String, PortRecord>,
    widgets: HashMap<WidgetId, WidgetRecord>,
    /// Registration order, for stable snapshots.
    widget_order: Vec<WidgetId>,
}

/// Thread-safe health bookkeeping shared by schedulers and the host.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<BoardInner>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare `port` (state [`PortState::Idle`] on first registration) and
    /// arm its cycle deadline.
    pub fn register_port(&self, port: &str, stall_timeout: Duration) {
        let mut inner = self.lock();
        inner.watchdog.register(port, stall_timeout);
        inner.ports.entry(port.to_string()).or_insert(PortRecord {
            state: PortState::Idle,
            last_error: None,
            restarts: 0,
        });
    }

    /// Declare a widget sampled on `port`.  Idempotent.
    pub fn register_widget(&self, widget: WidgetId, port: &str, name: &str) {
        let mut inner = self.lock();
        if inner.widgets.contains_key(&widget) {
            return;
        }
        inner.widgets.insert(
            widget,
            WidgetRecord {
                port: port.to_string(),
                name: name.to_string(),
                last_value: None,
                last_error: None,
                last_error_at: None,
                consecutive_failures: 0,
            },
        );
        inner.widget_order.push(widget);
    }

    /// Set the state of `port`, returning the previous one (`None` if the
    /// port was unknown; it is registered implicitly).
    pub fn set_port_state(&self, port: &str, state: PortState) -> Option<PortState> {
        let mut inner = self.lock();
        if let Some(record) = inner.ports.get_mut(port) {
            return Some(std::mem::replace(&mut record.state, state));
        }
        inner.ports.insert(
            port.to_string(),
            PortRecord {
                state,
                last_error: None,
                restarts: 0,
            },
        );
        None
    }

    pub fn port_state(&self, port: &str) -> Option<PortState> {
        self.lock().ports.get(port).map(|r| r.state)
    }

    /// Record why a port's scheduler terminated.
    pub fn record_port_error(&self, port: &str, message: impl Into<String>) {
        if let Some(record) = self.lock().ports.get_mut(port) {
            record.last_error = Some(message.into());
        }
    }

    pub fn record_restart(&self, port: &str) {
        if let Some(record) = self.lock().ports.get_mut(port) {
            record.restarts += 1;
        }
    }

    /// A full sample/event cycle completed on `port`.
    pub fn record_cycle(&self, port: &str) {
        self.lock().watchdog.heartbeat(port);
    }

    pub fn record_sample(&self, widget: WidgetId, value: f64) {
        if let Some(record) = self.lock().widgets.get_mut(&widget) {
            record.last_value = Some(value);
            record.consecutive_failures = 0;
        }
    }

    /// Record a failed read together with the widget's current failure
    /// streak as counted by the scheduler.
    pub fn record_sample_error(&self, widget: WidgetId, message: impl Into<String>, streak: u32) {
        if let Some(record) = self.lock().widgets.get_mut(&widget) {
            record.last_error = Some(message.into());
            record.last_error_at = Some(Utc::now());
            record.consecutive_failures = streak;
        }
    }

    /// `true` when any widget on `port` has a non-zero failure streak.
    pub fn port_has_unhealthy_widgets(&self, port: &str) -> bool {
        self.lock()
            .widgets
            .values()
            .any(|w| w.port == port && w.consecutive_failures > 0)
    }

    pub fn cycles(&self, port: &str) -> u64 {
        self.lock().watchdog.cycles(port)
    }

    pub fn last_cycle_at(&self, port: &str) -> Option<DateTime<Utc>> {
        self.lock().watchdog.last_cycle_at(port)
    }

    /// Running ports whose cycle deadline has expired.
    pub fn stalled_ports(&self) -> Vec<String> {
        let inner = self.lock();
        inner
            .watchdog
            .stalled()
            .into_iter()
            .filter(|port| {
                matches!(
                    inner.ports.get(port).map(|r| r.state),
                    Some(PortState::Sampling | PortState::Degraded)
                )
            })
            .collect()
    }

    pub fn is_alive(&self, port: &str) -> bool {
        self.lock().watchdog.liveness(port) == Liveness::Alive
    }

    /// Plain copy of everything on the board.
    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        let ports = inner
            .ports
            .iter()
            .map(|(name, record)| PortStatus {
                name: name.clone(),
                state: record.state,
                cycles: inner.watchdog.cycles(name),
                last_cycle_at: inner.watchdog.last_cycle_at(name),
                last_error: record.last_error.clone(),
                restarts: record.restarts,
            })
            .collect();
        let widgets = inner
            .widget_order
            .iter()
            .filter_map(|id| {
                inner.widgets.get(id).map(|w| WidgetStatus {
                    id: *id,
                    port: w.port.clone(),
                    name: w.name.clone(),
                    healthy: w.consecutive_failures == 0,
                    consecutive_failures: w.consecutive_failures,
                    last_value: w.last_value,
                    last_error: w.last_error.clone(),
                    last_error_at: w.last_error_at,
                })
            })
            .collect();
        StatusSnapshot { ports, widgets }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshot types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub name: String,
    pub state: PortState,
    pub cycles: u64,
    /// Time of the last successful cycle.
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restarts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WidgetStatus {
    pub id: WidgetId,
    pub port: String,
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_value: Option<f64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ports: Vec<PortStatus>,
    pub widgets: Vec<WidgetStatus>,
}

impl StatusSnapshot {
    pub fn port(&self, name: &str) -> Option<&PortStatus> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn widget(&self, id: WidgetId) -> Option<&WidgetStatus> {
        self.widgets.iter().find(|w| w.id == id)
    }

    /// One-line summary for a status bar: `failed(<ports>)`,
    /// `degraded(<ports>)`, `sampling`, or `idling`, most severe first.
    pub fn headline(&self) -> String {
        let in_state = |state: PortState| -> Vec<&str> {
            self.ports
                .iter()
                .filter(|p| p.state == state)
                .map(|p| p.name.as_str())
                .collect()
        };

        let failed = in_state(PortState::Failed);
        if !failed.is_empty() {
            return format!("failed({})", failed.join(", "));
        }
        let degraded = in_state(PortState::Degraded);
        if !degraded.is_empty() {
            return format!("degraded({})", degraded.join(", "));
        }
        if !in_state(PortState::Sampling).is_empty() {
            return "sampling".to_string();
        }
        "idling".to_string()
    }
}
