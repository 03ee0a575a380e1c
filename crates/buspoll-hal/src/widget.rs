//! [`Widget`] – a logical measurement/control point bound to one device.
//!
//! A widget owns its configuration ([`WidgetMeta`]), at most one open
//! [`SlaveConnection`], and an ordered list of [`EventHandler`]s.  It is
//! created by the host, registered in a
//! [`Registry`][crate::registry::Registry], initialised by a
//! [`WidgetCommand::InitializeSlave`] broadcast, and from then on sampled by
//! the scheduler of its port.
//!
//! Widgets are shared between the registry, the port scheduler and the host
//! through a [`WidgetHandle`].  Only the scheduler of the widget's port issues
//! I/O through it; everybody else takes short-lived snapshots.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use buspoll_types::{PollError, Sample, WidgetId, WidgetMeta};
use chrono::Utc;
use tracing::debug;

use crate::slave::{SlaveConnection, SlaveConnector};

/// Typed commands broadcast to every registered widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetCommand {
    /// Open the slave connection.  Consumed once per widget; repeated
    /// deliveries are no-ops.
    InitializeSlave,
}

/// Read-only view handed to event handlers.
#[derive(Debug)]
pub struct EventContext<'a> {
    pub widget: WidgetId,
    pub meta: &'a WidgetMeta,
    /// Most recent successfully sampled value, if any.
    pub last_value: Option<f64>,
}

/// A per-cycle hook (UI refresh, control action, ...) owned by a widget.
pub trait EventHandler: Send {
    /// Run once per scheduler cycle, after the sample phase.
    ///
    /// # Errors
    ///
    /// Any error is logged by the scheduler and never stops the remaining
    /// handlers.
    fn handle(&mut self, ctx: &EventContext<'_>) -> Result<(), PollError>;
}

impl<F> EventHandler for F
where
    F: FnMut(&EventContext<'_>) -> Result<(), PollError> + Send,
{
    fn handle(&mut self, ctx: &EventContext<'_>) -> Result<(), PollError> {
        self(ctx)
    }
}

/// A measurement/control point and its device link.
pub struct Widget {
    id: WidgetId,
    meta: WidgetMeta,
    connector: Arc<dyn SlaveConnector>,
    slave: Option<Box<dyn SlaveConnection>>,
    events: Vec<Box<dyn EventHandler>>,
    on_init: Vec<Box<dyn EventHandler>>,
    last_value: Option<f64>,
    attached_port: Option<String>,
}

impl Widget {
    /// Create a widget that will open its connection through `connector`.
    pub fn new(meta: WidgetMeta, connector: Arc<dyn SlaveConnector>) -> Self {
        Self {
            id: WidgetId::new(),
            meta,
            connector,
            slave: None,
            events: Vec::new(),
            on_init: Vec::new(),
            last_value: None,
            attached_port: None,
        }
    }

    /// Builder-style variant of [`Widget::add_event`].
    pub fn with_event(mut self, handler: impl EventHandler + 'static) -> Self {
        self.add_event(handler);
        self
    }

    /// Append an event handler.  Handlers run in insertion order.
    pub fn add_event(&mut self, handler: impl EventHandler + 'static) {
        self.events.push(Box::new(handler));
    }

    /// Builder-style variant of [`Widget::add_on_init`].
    pub fn with_on_init(mut self, hook: impl EventHandler + 'static) -> Self {
        self.add_on_init(hook);
        self
    }

    /// Append a hook that runs once, right after the slave connection opens.
    pub fn add_on_init(&mut self, hook: impl EventHandler + 'static) {
        self.on_init.push(Box::new(hook));
    }

    pub fn id(&self) -> WidgetId {
        self.id
    }

    pub fn meta(&self) -> &WidgetMeta {
        &self.meta
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// `true` once the slave connection has been opened.
    pub fn is_initialized(&self) -> bool {
        self.slave.is_some()
    }

    /// Port this widget has been attached to in the registry, if any.
    pub fn attached_port(&self) -> Option<&str> {
        self.attached_port.as_deref()
    }

    pub(crate) fn mark_attached(&mut self, port: &str) {
        self.attached_port = Some(port.to_string());
    }

    // -------------------------------------------------------------------------
    // Configuration surface
    // -------------------------------------------------------------------------

    /// Replace the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::ConfigLocked`] once the slave connection is open,
    /// or when the port name would change after the widget was attached.
    pub fn set_meta(&mut self, meta: WidgetMeta) -> Result<(), PollError> {
        self.ensure_unlocked()?;
        if self.attached_port.is_some() && meta.port_name != self.meta.port_name {
            return Err(PollError::ConfigLocked(self.id));
        }
        self.meta = meta;
        Ok(())
    }

    pub fn set_port_name(&mut self, port_name: impl Into<String>) -> Result<(), PollError> {
        let meta = WidgetMeta {
            port_name: port_name.into(),
            ..self.meta.clone()
        };
        self.set_meta(meta)
    }

    pub fn set_channel(&mut self, channel: u8) -> Result<(), PollError> {
        self.ensure_unlocked()?;
        self.meta.channel = channel;
        Ok(())
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), PollError> {
        self.ensure_unlocked()?;
        self.meta.baud_rate = baud_rate;
        Ok(())
    }

    fn ensure_unlocked(&self) -> Result<(), PollError> {
        if self.slave.is_some() {
            Err(PollError::ConfigLocked(self.id))
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Handle a broadcast [`WidgetCommand`].
    pub fn dispatch(&mut self, command: WidgetCommand) -> Result<(), PollError> {
        match command {
            WidgetCommand::InitializeSlave => self.initialize().map(|_| ()),
        }
    }

    /// Open the slave connection unless it is already open.
    ///
    /// Returns `Ok(true)` when a connection was opened by this call and
    /// `Ok(false)` when one already existed.
    ///
    /// The on-init hooks run in insertion order once the connection is
    /// open.
    ///
    /// # Errors
    ///
    /// Propagates the connector's [`PollError::Connection`].  A failing
    /// on-init hook closes the connection again, leaves the widget
    /// uninitialised and returns the hook's error.
    pub fn initialize(&mut self) -> Result<bool, PollError> {
        if self.slave.is_some() {
            return Ok(false);
        }
        let slave = self.connector.open(&self.meta)?;
        self.slave = Some(slave);
        debug!(
            widget = %self.id,
            port = %self.meta.port_name,
            address = self.meta.slave_address,
            "slave connection opened"
        );

        let ctx = EventContext {
            widget: self.id,
            meta: &self.meta,
            last_value: self.last_value,
        };
        for hook in &mut self.on_init {
            if let Err(e) = hook.handle(&ctx) {
                self.slave = None;
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Take one reading, tagged with `elapsed` since the scheduler started.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::NotInitialized`] without touching the bus when no
    /// connection is open; otherwise whatever the connection reports.
    pub fn sample(&mut self, elapsed: Duration) -> Result<Sample, PollError> {
        let slave = self
            .slave
            .as_mut()
            .ok_or(PollError::NotInitialized(self.id))?;
        let value = slave.read_value()?;
        self.last_value = Some(value);
        Ok(Sample {
            widget: self.id,
            port: self.meta.port_name.clone(),
            name: self.meta.name.clone(),
            unit: self.meta.unit.clone(),
            value,
            elapsed_secs: elapsed.as_secs_f64(),
            timestamp: Utc::now(),
        })
    }

    /// Run every event handler in order.
    ///
    /// Returns the failures as `(handler index, error)`; a failing handler
    /// never prevents the following ones from running.
    pub fn run_events(&mut self) -> Vec<(usize, PollError)> {
        let ctx = EventContext {
            widget: self.id,
            meta: &self.meta,
            last_value: self.last_value,
        };
        self.events
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, handler)| handler.handle(&ctx).err().map(|e| (idx, e)))
            .collect()
    }
}

impl std::fmt::Debug for Widget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Widget")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("initialized", &self.slave.is_some())
            .field("events", &self.events.len())
            .field("on_init", &self.on_init.len())
            .field("last_value", &self.last_value)
            .field("attached_port", &self.attached_port)
            .finish()
    }
}

/// Shared handle to a registered [`Widget`].
///
/// The id is cached so lookups never need the lock.
#[derive(Clone)]
pub struct WidgetHandle {
    id: WidgetId,
    inner: Arc<Mutex<Widget>>,
}

impl WidgetHandle {
    pub fn new(widget: Widget) -> Self {
        Self {
            id: widget.id(),
            inner: Arc::new(Mutex::new(widget)),
        }
    }

    pub fn id(&self) -> WidgetId {
        self.id
    }

    /// Lock the widget.  A poisoned lock (a handler panicked mid-cycle) is
    /// recovered; the widget state itself stays consistent.
    pub fn lock(&self) -> MutexGuard<'_, Widget> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` if both handles point at the same widget instance.
    pub fn ptr_eq(&self, other: &WidgetHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for WidgetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WidgetHandle").field(&self.id).finish()
    }
}
