//! `buspoll-kernel` – health bookkeeping.
//!
//! # Modules
//!
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: tracks one heartbeat
//!   per completed scheduler cycle and detects ports whose bus has stopped
//!   answering.
//! - [`status`] – [`StatusBoard`][status::StatusBoard]: thread-safe record of
//!   port states, last successful cycle times, and per-widget errors, with a
//!   serialisable [`StatusSnapshot`][status::StatusSnapshot] for host status
//!   surfaces.

pub mod status;
pub mod watchdog;

pub use status::{PortStatus, StatusBoard, StatusSnapshot, WidgetStatus};
pub use watchdog::{Liveness, Watchdog};
