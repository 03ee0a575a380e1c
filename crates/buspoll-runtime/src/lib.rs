//! `buspoll-runtime` – the polling engine.
//!
//! Runs one sampling loop per physical port, each on its own OS thread, so a
//! slow or failing bus never delays another.
//!
//! # Modules
//!
//! - [`scheduler`] – [`PortScheduler`][scheduler::PortScheduler]: the
//!   per-port cycle (sample phase, event phase, heartbeat, pacing) and its
//!   [`SchedulerHandle`][scheduler::SchedulerHandle].
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]: opens
//!   every slave connection once, starts one scheduler per port, supervises
//!   them under a [`RestartPolicy`][orchestrator::RestartPolicy], and shuts
//!   them down within a bounded deadline.
//! - [`failure_guard`] – [`FailureGuard`][failure_guard::FailureGuard]:
//!   consecutive-failure counter that decides when a widget is escalated.
//! - [`cancel`] – [`CancelToken`][cancel::CancelToken]: stop flag with an
//!   interruptible pacing sleep.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber.

pub mod cancel;
pub mod failure_guard;
pub mod orchestrator;
pub mod scheduler;
pub mod telemetry;

pub use cancel::CancelToken;
pub use failure_guard::FailureGuard;
pub use orchestrator::{
    InitReport, Orchestrator, OrchestratorConfig, RestartPolicy, ShutdownReport,
    SupervisionAction,
};
pub use scheduler::{JoinOutcome, PortScheduler, SchedulerConfig, SchedulerHandle, SchedulerPhase};
pub use telemetry::{LogFormat, init_tracing};
