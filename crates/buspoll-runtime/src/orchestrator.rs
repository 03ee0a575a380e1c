//! [`Orchestrator`] – owns the registry and one scheduler per port.
//!
//! Lifecycle:
//!
//! 1. [`Orchestrator::initialize_all`] opens every slave connection once.
//! 2. [`Orchestrator::start_schedulers`] spawns one thread per port that has
//!    attached widgets.
//! 3. The host calls [`Orchestrator::supervise`] periodically to reap exited
//!    schedulers, apply the [`RestartPolicy`], and flag stalled ports.
//! 4. [`Orchestrator::shutdown`] cancels every scheduler and joins them
//!    within a shared deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use buspoll_hal::{Registry, WidgetCommand};
use buspoll_kernel::{StatusBoard, StatusSnapshot};
use buspoll_middleware::EventBus;
use buspoll_types::{Event, EventPayload, PollError, PortState, WidgetId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::scheduler::{JoinOutcome, PortScheduler, SchedulerConfig, SchedulerHandle};

const SOURCE: &str = "buspoll-runtime::orchestrator";

/// What [`Orchestrator::supervise`] does with a scheduler that terminated on
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Leave the port failed.
    #[default]
    Never,
    /// Start a fresh scheduler, at most `max_restarts` times per port.
    OnFailure { max_restarts: u32 },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub restart_policy: RestartPolicy,
    /// Default deadline for [`Orchestrator::shutdown_default`].
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            restart_policy: RestartPolicy::Never,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Result of [`Orchestrator::initialize_all`].
#[derive(Debug, Default)]
pub struct InitReport {
    /// Connections opened by this call.
    pub opened: usize,
    /// Widgets whose connector refused to open; they are never sampled.
    pub failed: Vec<(WidgetId, PollError)>,
    /// `true` when the setup broadcast had already been sent.
    pub skipped: bool,
}

/// One decision taken by [`Orchestrator::supervise`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionAction {
    /// The scheduler exited after cancellation.
    Exited { port: String },
    /// A failed scheduler was replaced.
    Restarted { port: String, attempt: u32 },
    /// A failed scheduler was left down.
    GaveUp { port: String, reason: String },
    /// The port has not completed a cycle within its stall timeout.
    Stalled { port: String },
}

/// Result of [`Orchestrator::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Ports whose scheduler exited cleanly.
    pub stopped: Vec<String>,
    /// Ports whose scheduler had already failed or panicked.
    pub failed: Vec<(String, String)>,
    /// Ports whose worker was still blocked at the deadline and was detached.
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// Top-level owner of the polling system.
pub struct Orchestrator {
    registry: Arc<Registry>,
    bus: EventBus,
    status: Arc<StatusBoard>,
    config: OrchestratorConfig,
    schedulers: BTreeMap<String, SchedulerHandle>,
    restarts: BTreeMap<String, u32>,
    initialized: bool,
}

impl Orchestrator {
    /// Take ownership of a fully attached registry.  The registry is
    /// read-only from here on.
    pub fn new(registry: Registry, bus: EventBus, config: OrchestratorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            bus,
            status: Arc::new(StatusBoard::new()),
            config,
            schedulers: BTreeMap::new(),
            restarts: BTreeMap::new(),
            initialized: false,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn status(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.status)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Send [`WidgetCommand::InitializeSlave`] to every widget.
    ///
    /// Failures are logged and reported per widget; they do not stop the
    /// broadcast.  Only the first call broadcasts.
    pub fn initialize_all(&mut self) -> InitReport {
        if self.initialized {
            warn!("initialize_all called twice; ignoring");
            return InitReport {
                skipped: true,
                ..InitReport::default()
            };
        }

        let before = self.open_connections();
        let failed = self.registry.broadcast(WidgetCommand::InitializeSlave);
        for (widget, e) in &failed {
            warn!(widget = %widget, error = %e, "slave connection could not be opened");
        }
        let opened = self.open_connections().saturating_sub(before);
        self.initialized = true;

        info!(
            widgets = self.registry.len(),
            opened,
            failed = failed.len(),
            "slave connections initialised"
        );
        InitReport {
            opened,
            failed,
            skipped: false,
        }
    }

    fn open_connections(&self) -> usize {
        self.registry
            .widgets()
            .iter()
            .filter(|handle| handle.lock().is_initialized())
            .count()
    }

    /// Start one scheduler per port with attached widgets.
    ///
    /// Ports that already have a scheduler are skipped.  Returns how many
    /// schedulers this call started.
    ///
    /// # Errors
    ///
    /// [`PollError::Lifecycle`] before [`Orchestrator::initialize_all`];
    /// [`PollError::Spawn`] if a thread cannot be created (schedulers
    /// started earlier in the call keep running).
    pub fn start_schedulers(&mut self) -> Result<usize, PollError> {
        if !self.initialized {
            return Err(PollError::Lifecycle(
                "start_schedulers requires initialize_all first".to_string(),
            ));
        }

        let mut started = 0;
        for port in self.registry.port_names() {
            if self.schedulers.contains_key(&port) {
                debug!(port = %port, "scheduler already running");
                continue;
            }
            self.spawn_port(&port)?;
            started += 1;
        }
        info!(started, running = self.schedulers.len(), "schedulers started");
        Ok(started)
    }

    fn spawn_port(&mut self, port: &str) -> Result<(), PollError> {
        let scheduler = PortScheduler::new(
            port,
            &self.registry,
            self.bus.clone(),
            Arc::clone(&self.status),
            self.config.scheduler.clone(),
        );
        let handle = scheduler.spawn(CancelToken::new())?;
        self.schedulers.insert(port.to_string(), handle);
        Ok(())
    }

    /// Reap exited schedulers, apply the restart policy, and mark stalled
    /// ports as degraded.
    pub fn supervise(&mut self) -> Vec<SupervisionAction> {
        let mut actions = Vec::new();

        let finished: Vec<String> = self
            .schedulers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(port, _)| port.clone())
            .collect();

        for port in finished {
            let Some(handle) = self.schedulers.remove(&port) else {
                continue;
            };
            let reason = match handle.join() {
                JoinOutcome::Stopped | JoinOutcome::TimedOut => {
                    info!(port = %port, "scheduler exited");
                    actions.push(SupervisionAction::Exited { port });
                    continue;
                }
                JoinOutcome::Failed(e) => e.to_string(),
                JoinOutcome::Panicked(msg) => {
                    error!(port = %port, panic = %msg, "scheduler panicked");
                    let reason = format!("panicked: {msg}");
                    self.mark_failed(&port, &reason);
                    reason
                }
            };
            actions.push(self.apply_restart_policy(port, reason));
        }

        for port in self.status.stalled_ports() {
            if self.status.set_port_state(&port, PortState::Degraded) != Some(PortState::Degraded) {
                warn!(port = %port, "no completed cycle within the stall timeout");
                self.bus.publish(Event::new(
                    SOURCE,
                    EventPayload::PortStateChanged {
                        port: port.clone(),
                        state: PortState::Degraded,
                    },
                ));
            }
            actions.push(SupervisionAction::Stalled { port });
        }

        actions
    }

    /// A panicking worker never reached its own exit bookkeeping.
    fn mark_failed(&self, port: &str, reason: &str) {
        self.status.record_port_error(port, reason);
        self.status.set_port_state(port, PortState::Failed);
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::PortStateChanged {
                port: port.to_string(),
                state: PortState::Failed,
            },
        ));
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::SchedulerExited {
                port: port.to_string(),
                reason: reason.to_string(),
            },
        ));
    }

    fn apply_restart_policy(&mut self, port: String, reason: String) -> SupervisionAction {
        let max_restarts = match self.config.restart_policy {
            RestartPolicy::Never => {
                error!(port = %port, reason = %reason, "scheduler failed; restart policy is never");
                return SupervisionAction::GaveUp { port, reason };
            }
            RestartPolicy::OnFailure { max_restarts } => max_restarts,
        };

        let attempt = self.restarts.get(&port).copied().unwrap_or(0) + 1;
        if attempt > max_restarts {
            error!(port = %port, reason = %reason, max_restarts, "restart budget exhausted");
            return SupervisionAction::GaveUp { port, reason };
        }

        match self.spawn_port(&port) {
            Ok(()) => {
                self.restarts.insert(port.clone(), attempt);
                self.status.record_restart(&port);
                warn!(port = %port, attempt, reason = %reason, "scheduler restarted");
                SupervisionAction::Restarted { port, attempt }
            }
            Err(e) => {
                error!(port = %port, error = %e, "scheduler restart failed");
                SupervisionAction::GaveUp {
                    port,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Ports whose scheduler thread is still alive.
    pub fn running_ports(&self) -> Vec<String> {
        self.schedulers
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(port, _)| port.clone())
            .collect()
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Cancel every scheduler and wait for them, sharing one `timeout`
    /// across all joins.
    ///
    /// Workers still blocked in a read at the deadline are detached and
    /// reported in [`ShutdownReport::timed_out`].
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        for handle in self.schedulers.values() {
            handle.cancel();
        }

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        for (port, handle) in std::mem::take(&mut self.schedulers) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.join_timeout(remaining) {
                JoinOutcome::Stopped => report.stopped.push(port),
                JoinOutcome::Failed(e) => report.failed.push((port, e.to_string())),
                JoinOutcome::Panicked(msg) => {
                    self.mark_failed(&port, &format!("panicked: {msg}"));
                    report.failed.push((port, msg));
                }
                JoinOutcome::TimedOut => {
                    warn!(port = %port, timeout_ms = timeout.as_millis() as u64, "scheduler did not stop in time; detached");
                    self.status
                        .record_port_error(&port, "detached after shutdown timeout");
                    report.timed_out.push(port);
                }
            }
        }

        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            "shutdown complete"
        );
        report
    }

    /// [`Orchestrator::shutdown`] with the configured timeout.
    pub fn shutdown_default(&mut self) -> ShutdownReport {
        self.shutdown(self.config.shutdown_timeout)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for handle in self.schedulers.values() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buspoll_hal::{FaultPlan, SimConnector, Waveform, Widget};
    use buspoll_types::{ErrorClass, WidgetMeta};
    use std::thread;

    fn widget(name: &str, port: &str, connector: SimConnector) -> Widget {
        Widget::new(
            WidgetMeta {
                device_type: "sim".to_string(),
                name: name.to_string(),
                port_name: port.to_string(),
                ..WidgetMeta::default()
            },
            Arc::new(connector),
        )
    }

    fn fast_config(policy: RestartPolicy) -> OrchestratorConfig {
        OrchestratorConfig {
            scheduler: SchedulerConfig {
                sampling_period: Duration::from_millis(10),
                ..SchedulerConfig::default()
            },
            restart_policy: policy,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_requires_initialisation() {
        let mut registry = Registry::new();
        registry
            .register_and_attach(widget("w1", "A", SimConnector::new(Waveform::Constant(1.0))))
            .unwrap();
        let mut orch = Orchestrator::new(registry, EventBus::default(), fast_config(RestartPolicy::Never));
        assert!(matches!(orch.start_schedulers(), Err(PollError::Lifecycle(_))));
    }

    #[test]
    fn second_initialize_is_a_no_op() {
        let mut registry = Registry::new();
        registry
            .register_and_attach(widget("w1", "A", SimConnector::new(Waveform::Constant(1.0))))
            .unwrap();
        registry
            .register_and_attach(widget(
                "w2",
                "A",
                SimConnector::new(Waveform::Constant(1.0)).failing_open("permission denied"),
            ))
            .unwrap();
        let mut orch = Orchestrator::new(registry, EventBus::default(), fast_config(RestartPolicy::Never));

        let first = orch.initialize_all();
        assert_eq!(first.opened, 1);
        assert_eq!(first.failed.len(), 1);
        assert!(!first.skipped);

        let second = orch.initialize_all();
        assert!(second.skipped);
        assert_eq!(second.opened, 0);
    }

    #[test]
    fn start_is_idempotent_and_skips_empty_ports() {
        let mut registry = Registry::new();
        registry
            .register_and_attach(widget("w1", "A", SimConnector::new(Waveform::Constant(1.0))))
            .unwrap();
        registry
            .register_and_attach(widget("w2", "B", SimConnector::new(Waveform::Constant(2.0))))
            .unwrap();
        // Registered but never attached: no scheduler for port C.
        registry.register(widget("w3", "C", SimConnector::new(Waveform::Constant(3.0))));

        let mut orch = Orchestrator::new(registry, EventBus::default(), fast_config(RestartPolicy::Never));
        orch.initialize_all();
        assert_eq!(orch.start_schedulers().unwrap(), 2);
        assert_eq!(orch.start_schedulers().unwrap(), 0);
        assert_eq!(orch.running_ports(), ["A", "B"]);

        let report = orch.shutdown(Duration::from_secs(2));
        assert!(report.is_clean());
        assert_eq!(report.stopped, ["A", "B"]);
        assert!(orch.running_ports().is_empty());
    }

    #[test]
    fn failed_port_is_left_down_under_never() {
        let mut registry = Registry::new();
        registry
            .register_and_attach(widget(
                "w1",
                "A",
                SimConnector::new(Waveform::Constant(1.0))
                    .with_faults(FaultPlan::Always(ErrorClass::Fatal)),
            ))
            .unwrap();
        let mut orch = Orchestrator::new(registry, EventBus::default(), fast_config(RestartPolicy::Never));
        orch.initialize_all();
        orch.start_schedulers().unwrap();

        assert!(wait_until(|| orch.running_ports().is_empty()));
        let actions = orch.supervise();
        assert!(matches!(
            actions.as_slice(),
            [SupervisionAction::GaveUp { port, .. }] if port == "A"
        ));
        let snapshot = orch.status_snapshot();
        assert_eq!(snapshot.port("A").map(|p| p.state), Some(PortState::Failed));
        assert_eq!(snapshot.headline(), "failed(A)");
    }

    #[test]
    fn on_failure_restarts_until_budget_is_spent() {
        let mut registry = Registry::new();
        registry
            .register_and_attach(widget(
                "w1",
                "A",
                SimConnector::new(Waveform::Constant(1.0))
                    .with_faults(FaultPlan::Always(ErrorClass::Fatal)),
            ))
            .unwrap();
        let mut orch = Orchestrator::new(
            registry,
            EventBus::default(),
            fast_config(RestartPolicy::OnFailure { max_restarts: 1 }),
        );
        orch.initialize_all();
        orch.start_schedulers().unwrap();

        assert!(wait_until(|| orch.running_ports().is_empty()));
        assert_eq!(
            orch.supervise(),
            [SupervisionAction::Restarted {
                port: "A".to_string(),
                attempt: 1
            }]
        );

        assert!(wait_until(|| orch.running_ports().is_empty()));
        assert!(matches!(
            orch.supervise().as_slice(),
            [SupervisionAction::GaveUp { .. }]
        ));
        assert_eq!(orch.status_snapshot().port("A").map(|p| p.restarts), Some(1));
    }
}
