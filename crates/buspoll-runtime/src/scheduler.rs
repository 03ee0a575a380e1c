//! Per-port sampling loop.
//!
//! A [`PortScheduler`] owns the snapshot of widgets attached to one port and
//! drives them from a dedicated OS thread:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  1. Cancelled?  ──yes──► exit (Stopped)                      │
//! │  2. Sample      – read every initialised widget, in order     │
//! │  3. Events      – run every widget's handlers, in order       │
//! │  4. Heartbeat   – record the completed cycle                  │
//! │  5. Pace        – wait (period - work), interruptible         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Read failures are classified by [`PollError::class`]: transient errors are
//! logged and retried next cycle, protocol errors escalate once a widget
//! returns enough of them in a row, and fatal errors end the loop.
//! Event handler failures never end the loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use buspoll_hal::{Registry, WidgetHandle};
use buspoll_kernel::StatusBoard;
use buspoll_middleware::EventBus;
use buspoll_types::{ErrorClass, Event, EventPayload, PollError, PortState};
use tracing::{debug, error, info, info_span, warn};

use crate::cancel::CancelToken;
use crate::failure_guard::FailureGuard;

const SOURCE: &str = "buspoll-runtime::scheduler";

/// Interval at which [`SchedulerHandle::join_timeout`] re-checks the worker.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Tuning shared by every port scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Target duration of one cycle.  Work time is subtracted from the pause;
    /// an overrun starts the next cycle immediately.
    pub sampling_period: Duration,
    /// Consecutive protocol errors after which a widget is escalated.
    /// Transient errors interrupt the run.  `0` disables escalation.
    pub max_consecutive_failures: u32,
    /// A running port with no completed cycle for this long is stalled.
    /// Never armed below two sampling periods; see
    /// [`SchedulerConfig::watchdog_deadline`].
    pub stall_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sampling_period: Duration::from_millis(500),
            max_consecutive_failures: 5,
            stall_timeout: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Gap between completed cycles after which the port counts as stalled.
    ///
    /// A healthy port spends most of a period in its pacing wait, so the
    /// deadline is at least two periods whatever `stall_timeout` says.
    pub fn watchdog_deadline(&self) -> Duration {
        self.stall_timeout.max(self.sampling_period.saturating_mul(2))
    }
}

/// Lifecycle of one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Created,
    Initializing,
    Running,
    Terminated,
}

/// Sampling loop for the widgets attached to one port.
pub struct PortScheduler {
    port: String,
    widgets: Vec<WidgetHandle>,
    bus: EventBus,
    status: Arc<StatusBoard>,
    config: SchedulerConfig,
    guard: FailureGuard,
    phase: Arc<Mutex<SchedulerPhase>>,
}

impl PortScheduler {
    /// Snapshot the widgets attached to `port` and declare them on the
    /// status board.
    pub fn new(
        port: impl Into<String>,
        registry: &Registry,
        bus: EventBus,
        status: Arc<StatusBoard>,
        config: SchedulerConfig,
    ) -> Self {
        let port = port.into();
        let widgets = registry.widgets_on_port(&port);

        status.register_port(&port, config.watchdog_deadline());
        for handle in &widgets {
            let widget = handle.lock();
            status.register_widget(widget.id(), &port, &widget.meta().name);
        }

        Self {
            guard: FailureGuard::new(config.max_consecutive_failures),
            port,
            widgets,
            bus,
            status,
            config,
            phase: Arc::new(Mutex::new(SchedulerPhase::Created)),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.len()
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the loop on a dedicated thread named `buspoll-port:<port>`.
    ///
    /// # Errors
    ///
    /// [`PollError::Spawn`] if the OS refuses to create the thread.
    pub fn spawn(self, cancel: CancelToken) -> Result<SchedulerHandle, PollError> {
        let port = self.port.clone();
        let phase = Arc::clone(&self.phase);
        self.set_phase(SchedulerPhase::Initializing);

        let worker_cancel = cancel.clone();
        let join = thread::Builder::new()
            .name(format!("buspoll-port:{port}"))
            .spawn(move || self.run(&worker_cancel))
            .map_err(|e| PollError::Spawn {
                port: port.clone(),
                details: e.to_string(),
            })?;

        Ok(SchedulerHandle {
            port,
            cancel,
            phase,
            join,
        })
    }

    /// Run cycles until `cancel` fires or a cycle returns an error.
    ///
    /// Called on the worker thread by [`PortScheduler::spawn`]; usable
    /// directly by hosts that manage their own threads.
    pub fn run(mut self, cancel: &CancelToken) -> Result<(), PollError> {
        let span = info_span!("port", port = %self.port);
        let _enter = span.enter();

        let started = Instant::now();
        self.set_phase(SchedulerPhase::Running);
        self.transition(PortState::Sampling);
        info!(
            widgets = self.widgets.len(),
            period_ms = self.config.sampling_period.as_millis() as u64,
            "scheduler running"
        );

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let cycle_start = Instant::now();
            if let Err(e) = self.run_cycle(started) {
                break Err(e);
            }

            let work = cycle_start.elapsed();
            if work > self.config.sampling_period {
                debug!(
                    work_ms = work.as_millis() as u64,
                    "cycle overran the sampling period"
                );
            }
            if cancel.wait_timeout(self.config.sampling_period.saturating_sub(work)) {
                break Ok(());
            }
        };

        self.finish(&result);
        result
    }

    /// One sample phase, one event phase and a heartbeat.
    ///
    /// `started` is the instant the scheduler began; samples carry the time
    /// elapsed since then.
    ///
    /// # Errors
    ///
    /// A fatal read error, or [`PollError::Escalated`] once a widget's
    /// protocol failures exhaust the failure guard.
    pub fn run_cycle(&mut self, started: Instant) -> Result<(), PollError> {
        self.sample_phase(started)?;
        self.event_phase();
        self.status.record_cycle(&self.port);
        self.refresh_health();
        Ok(())
    }

    fn sample_phase(&mut self, started: Instant) -> Result<(), PollError> {
        for handle in &self.widgets {
            let id = handle.id();
            let outcome = {
                let mut widget = handle.lock();
                if !widget.is_initialized() {
                    debug!(widget = %id, "no slave connection; skipped");
                    continue;
                }
                widget.sample(started.elapsed())
            };

            let error = match outcome {
                Ok(sample) => {
                    self.guard.record_success(id);
                    self.status.record_sample(id, sample.value);
                    self.bus
                        .publish(Event::new(SOURCE, EventPayload::Sample(sample)));
                    continue;
                }
                Err(e) => e,
            };

            let class = error.class();
            let streak = self.guard.record_failure(id, class);
            self.status
                .record_sample_error(id, error.to_string(), streak);
            self.bus.publish(Event::new(
                SOURCE,
                EventPayload::SampleFailed {
                    widget: id,
                    port: self.port.clone(),
                    class,
                    message: error.to_string(),
                },
            ));

            match class {
                ErrorClass::Transient => {
                    warn!(widget = %id, streak, error = %error, "read failed; retrying next cycle");
                }
                ErrorClass::Protocol if !self.guard.is_exhausted(id) => {
                    warn!(widget = %id, streak, error = %error, "bad response; widget skipped this cycle");
                }
                ErrorClass::Protocol => {
                    let failures = self.guard.protocol_streak(id);
                    error!(widget = %id, failures, error = %error, "widget escalated");
                    self.bus.publish(Event::new(
                        SOURCE,
                        EventPayload::WidgetDegraded {
                            widget: id,
                            port: self.port.clone(),
                            consecutive_failures: failures,
                        },
                    ));
                    return Err(PollError::Escalated {
                        widget: id,
                        failures,
                        last_error: error.to_string(),
                    });
                }
                ErrorClass::Fatal => {
                    error!(widget = %id, error = %error, "fatal read error");
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn event_phase(&self) {
        for handle in &self.widgets {
            let (id, failures) = {
                let mut widget = handle.lock();
                if !widget.is_initialized() {
                    continue;
                }
                (widget.id(), widget.run_events())
            };
            for (index, e) in failures {
                warn!(widget = %id, handler = index, error = %e, "event handler failed");
                self.bus.publish(Event::new(
                    SOURCE,
                    EventPayload::HandlerFailed {
                        widget: id,
                        port: self.port.clone(),
                        handler: index,
                        message: e.to_string(),
                    },
                ));
            }
        }
    }

    fn refresh_health(&self) {
        let state = if self.status.port_has_unhealthy_widgets(&self.port) {
            PortState::Degraded
        } else {
            PortState::Sampling
        };
        self.transition(state);
    }

    /// Set the board state, publishing a lifecycle event on change.
    fn transition(&self, state: PortState) {
        if self.status.set_port_state(&self.port, state) == Some(state) {
            return;
        }
        info!(state = %state, "port state changed");
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::PortStateChanged {
                port: self.port.clone(),
                state,
            },
        ));
    }

    fn finish(&self, result: &Result<(), PollError>) {
        let reason = match result {
            Ok(()) => {
                info!("scheduler stopped");
                self.transition(PortState::Stopped);
                "cancelled".to_string()
            }
            Err(e) => {
                error!(error = %e, "scheduler terminated");
                self.status.record_port_error(&self.port, e.to_string());
                self.transition(PortState::Failed);
                e.to_string()
            }
        };
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::SchedulerExited {
                port: self.port.clone(),
                reason,
            },
        ));
        self.set_phase(SchedulerPhase::Terminated);
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }
}

/// How a scheduler thread ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// Exited after cancellation.
    Stopped,
    /// Exited on a fatal or escalated error.
    Failed(PollError),
    /// The worker thread panicked.
    Panicked(String),
    /// Still running when the deadline passed; the thread was detached.
    TimedOut,
}

/// Owner-side handle to a running [`PortScheduler`].
pub struct SchedulerHandle {
    port: String,
    cancel: CancelToken,
    phase: Arc<Mutex<SchedulerPhase>>,
    join: JoinHandle<Result<(), PollError>>,
}

impl SchedulerHandle {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Ask the worker to stop after its current cycle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the worker to exit.  Blocks indefinitely.
    pub fn join(self) -> JoinOutcome {
        match self.join.join() {
            Ok(Ok(())) => JoinOutcome::Stopped,
            Ok(Err(e)) => JoinOutcome::Failed(e),
            Err(payload) => JoinOutcome::Panicked(panic_message(payload.as_ref())),
        }
    }

    /// Wait at most `timeout` for the worker to exit.
    ///
    /// On timeout the thread is detached and [`JoinOutcome::TimedOut`] is
    /// returned; it keeps running until its blocking read returns.
    pub fn join_timeout(self, timeout: Duration) -> JoinOutcome {
        let deadline = Instant::now() + timeout;
        while !self.join.is_finished() {
            if Instant::now() >= deadline {
                return JoinOutcome::TimedOut;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        self.join()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("port", &self.port)
            .field("phase", &self.phase())
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
