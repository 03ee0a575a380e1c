//! Slave connection capability: the contract a widget uses to talk to its
//! physical device.
//!
//! Concrete protocol drivers (Modbus RTU controllers, vendor ASCII protocols,
//! ...) live outside this crate.  They implement [`SlaveConnector`] once per
//! device family and hand out one [`SlaveConnection`] per widget.  The rest of
//! the system only ever talks to these traits, so a driver can be swapped
//! without touching the scheduler.
//!
//! A connection is never shared between widgets, even when they sit on the
//! same port.  Serialising access to the bus is the port scheduler's job, not
//! the connection's.

use buspoll_types::{PollError, WidgetMeta};

/// An open link to one device channel.
pub trait SlaveConnection: Send {
    /// Perform one synchronous read.
    ///
    /// Latency is bounded by the underlying transport's own timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::TransientIo`] for link hiccups,
    /// [`PollError::Protocol`] for malformed or unexpected responses, and
    /// [`PollError::Fatal`] when the device can no longer be used.
    fn read_value(&mut self) -> Result<f64, PollError>;
}

/// Factory for [`SlaveConnection`]s of one device family.
pub trait SlaveConnector: Send + Sync {
    /// Establish the physical link described by `meta` (port name, slave
    /// address, baud rate, channel).
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Connection`] when the link cannot be opened.
    fn open(&self, meta: &WidgetMeta) -> Result<Box<dyn SlaveConnection>, PollError>;
}

impl<F> SlaveConnector for F
where
    F: Fn(&WidgetMeta) -> Result<Box<dyn SlaveConnection>, PollError> + Send + Sync,
{
    fn open(&self, meta: &WidgetMeta) -> Result<Box<dyn SlaveConnection>, PollError> {
        self(meta)
    }
}
