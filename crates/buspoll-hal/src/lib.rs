//! `buspoll-hal` – widgets and the device capability they sample through.
//!
//! # Modules
//!
//! - [`slave`] – [`SlaveConnector`][slave::SlaveConnector] /
//!   [`SlaveConnection`][slave::SlaveConnection]: the pluggable contract a
//!   device family implements to open a link and perform one synchronous
//!   read.  Wire protocols live behind these traits.
//! - [`widget`] – [`Widget`][widget::Widget]: a measurement/control point
//!   with its configuration, its single slave connection, and its ordered
//!   event handlers; [`WidgetHandle`][widget::WidgetHandle] shares it between
//!   the registry, its port scheduler, and the host.
//! - [`registry`] – [`Registry`][registry::Registry]: the explicit arena of
//!   registered widgets and their port membership, plus the typed
//!   [`WidgetCommand`][widget::WidgetCommand] broadcast.
//! - [`sim`] – [`SimConnector`][sim::SimConnector]: a simulated device family
//!   with deterministic waveforms, injected latency, and scripted faults.

pub mod registry;
pub mod sim;
pub mod slave;
pub mod widget;

pub use registry::Registry;
pub use sim::{FaultPlan, ReadLog, SimConnector, Waveform};
pub use slave::{SlaveConnection, SlaveConnector};
pub use widget::{EventContext, EventHandler, Widget, WidgetCommand, WidgetHandle};
