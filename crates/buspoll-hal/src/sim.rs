//! Simulated device family for tests and bench setups without a bus.
//!
//! [`SimConnector`] opens [`SimConnection`]s that produce a deterministic
//! [`Waveform`], optionally sleep to mimic transport latency, and fail
//! according to a scripted [`FaultPlan`].  Counters and an optional shared
//! [`ReadLog`] record how the scheduler used them.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use buspoll_hal::sim::{SimConnector, Waveform};
//! use buspoll_hal::{Registry, Widget};
//! use buspoll_types::WidgetMeta;
//!
//! let connector = Arc::new(SimConnector::new(Waveform::Constant(20.0)));
//! let mut registry = Registry::new();
//! let handle = registry
//!     .register_and_attach(Widget::new(WidgetMeta::default(), connector.clone()))
//!     .unwrap();
//!
//! handle.lock().initialize().unwrap();
//! assert_eq!(connector.open_count(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use buspoll_types::{ErrorClass, PollError, WidgetMeta};

use crate::slave::{SlaveConnection, SlaveConnector};

// ────────────────────────────────────────────────────────────────────────────
// Waveform / fault plan
// ────────────────────────────────────────────────────────────────────────────

/// Value produced by the n-th successful read.
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Constant(f64),
    /// `start + n * step`
    Ramp { start: f64, step: f64 },
    /// `offset + amplitude * sin(2π n / period)`
    Sine {
        offset: f64,
        amplitude: f64,
        period: u32,
    },
}

impl Waveform {
    pub fn value_at(&self, n: u64) -> f64 {
        match *self {
            Waveform::Constant(v) => v,
            Waveform::Ramp { start, step } => start + step * n as f64,
            Waveform::Sine {
                offset,
                amplitude,
                period,
            } => {
                let period = f64::from(period.max(1));
                offset + amplitude * (std::f64::consts::TAU * n as f64 / period).sin()
            }
        }
    }
}

/// Scripted read failures.  Read numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPlan {
    #[default]
    Healthy,
    /// Every read fails.
    Always(ErrorClass),
    /// The first `n` reads fail, then the link recovers.
    FirstN(u32, ErrorClass),
    /// Every `n`-th read fails.
    EveryNth(u32, ErrorClass),
}

impl FaultPlan {
    fn fault_for(&self, read_no: u64) -> Option<ErrorClass> {
        match *self {
            FaultPlan::Healthy => None,
            FaultPlan::Always(class) => Some(class),
            FaultPlan::FirstN(n, class) => (read_no <= u64::from(n)).then_some(class),
            FaultPlan::EveryNth(n, class) => {
                (n > 0 && read_no % u64::from(n) == 0).then_some(class)
            }
        }
    }
}

fn simulated_error(class: ErrorClass, meta: &WidgetMeta) -> PollError {
    match class {
        ErrorClass::Transient => PollError::TransientIo(format!(
            "simulated timeout on {} (slave {})",
            meta.port_name, meta.slave_address
        )),
        ErrorClass::Protocol => PollError::Protocol(format!(
            "simulated malformed response from slave {}",
            meta.slave_address
        )),
        ErrorClass::Fatal => PollError::Fatal(format!(
            "simulated device loss on {}",
            meta.port_name
        )),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Read log
// ────────────────────────────────────────────────────────────────────────────

/// One `read_value` call as seen by the simulated device.
#[derive(Debug, Clone)]
pub struct ReadRecord {
    /// Widget display name (`meta.name`).
    pub name: String,
    pub port: String,
    pub at: Instant,
    pub ok: bool,
}

/// Shared, append-only log of reads across many simulated connections.
#[derive(Debug, Clone, Default)]
pub struct ReadLog {
    entries: Arc<Mutex<Vec<ReadRecord>>>,
}

impl ReadLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: ReadRecord) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Copy of every record so far, in call order.
    pub fn entries(&self) -> Vec<ReadRecord> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the widgets read on `port`, in call order.
    pub fn names_on_port(&self, port: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|r| r.port == port)
            .map(|r| r.name)
            .collect()
    }

    /// Number of successful reads for the widget called `name`.
    pub fn successes(&self, name: &str) -> usize {
        self.entries()
            .iter()
            .filter(|r| r.name == name && r.ok)
            .count()
    }

    /// Number of reads (successful or not) for the widget called `name`.
    pub fn attempts(&self, name: &str) -> usize {
        self.entries().iter().filter(|r| r.name == name).count()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connector
// ────────────────────────────────────────────────────────────────────────────

/// Factory for simulated connections.  Share one instance (behind an `Arc`)
/// between widgets to get aggregate counters.
#[derive(Debug)]
pub struct SimConnector {
    waveform: Waveform,
    latency: Duration,
    faults: FaultPlan,
    open_failure: Option<String>,
    log: Option<ReadLog>,
    opened: AtomicUsize,
    reads: Arc<AtomicUsize>,
}

impl SimConnector {
    pub fn new(waveform: Waveform) -> Self {
        Self {
            waveform,
            latency: Duration::ZERO,
            faults: FaultPlan::Healthy,
            open_failure: None,
            log: None,
            opened: AtomicUsize::new(0),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep this long inside every read.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Make every `open` fail with [`PollError::Connection`].
    pub fn failing_open(mut self, details: impl Into<String>) -> Self {
        self.open_failure = Some(details.into());
        self
    }

    /// Record every read into `log`.
    pub fn with_log(mut self, log: ReadLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of connections successfully opened.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Number of `read_value` calls across all connections of this connector.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl SlaveConnector for SimConnector {
    fn open(&self, meta: &WidgetMeta) -> Result<Box<dyn SlaveConnection>, PollError> {
        if let Some(details) = &self.open_failure {
            return Err(PollError::Connection {
                port: meta.port_name.clone(),
                details: details.clone(),
            });
        }
        self.opened.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SimConnection {
            meta: meta.clone(),
            waveform: self.waveform.clone(),
            latency: self.latency,
            faults: self.faults,
            log: self.log.clone(),
            reads: Arc::clone(&self.reads),
            calls: 0,
            produced: 0,
        }))
    }
}

/// A simulated link to one device channel.
pub struct SimConnection {
    meta: WidgetMeta,
    waveform: Waveform,
    latency: Duration,
    faults: FaultPlan,
    log: Option<ReadLog>,
    reads: Arc<AtomicUsize>,
    calls: u64,
    produced: u64,
}

impl SlaveConnection for SimConnection {
    fn read_value(&mut self) -> Result<f64, PollError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.calls += 1;
        self.reads.fetch_add(1, Ordering::AcqRel);

        let result = match self.faults.fault_for(self.calls) {
            Some(class) => Err(simulated_error(class, &self.meta)),
            None => {
                let value = self.waveform.value_at(self.produced);
                self.produced += 1;
                Ok(value)
            }
        };

        if let Some(log) = &self.log {
            log.push(ReadRecord {
                name: self.meta.name.clone(),
                port: self.meta.port_name.clone(),
                at: Instant::now(),
                ok: result.is_ok(),
            });
        }
        result
    }
}
