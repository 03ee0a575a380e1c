//! [`Registry`] – bookkeeping of every live widget and its port membership.
//!
//! The registry is an explicit object built once during setup.  Mutation
//! (`register`, `attach`) needs `&mut Registry`; once the orchestrator takes
//! ownership and wraps it in an `Arc`, the widget list and the port map are
//! read-only, so the sampling hot path needs no lock on the registry itself.
//!
//! # Ports
//!
//! A port is not an object of its own: it is the key of an ordered list of
//! widget ids.  The list preserves attach order, which is also the order in
//! which the port scheduler samples its widgets.

use std::collections::BTreeMap;

use buspoll_types::{PollError, WidgetId};
use tracing::{debug, warn};

use crate::widget::{Widget, WidgetCommand, WidgetHandle};

/// Arena of registered widgets plus the port → widget-id map.
#[derive(Default)]
pub struct Registry {
    widgets: Vec<WidgetHandle>,
    ports: BTreeMap<String, Vec<WidgetId>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `widget` and append it to the widget list.
    ///
    /// Because the widget is moved in, the same instance can never be
    /// registered twice.
    pub fn register(&mut self, widget: Widget) -> WidgetHandle {
        let handle = WidgetHandle::new(widget);
        debug!(widget = %handle.id(), "widget registered");
        self.widgets.push(handle.clone());
        handle
    }

    /// Register `widget` and attach it to the port named in its meta.
    ///
    /// # Errors
    ///
    /// See [`Registry::attach`].
    pub fn register_and_attach(&mut self, widget: Widget) -> Result<WidgetHandle, PollError> {
        let port = widget.meta().port_name.clone();
        let handle = self.register(widget);
        self.attach(handle.id(), &port)?;
        Ok(handle)
    }

    /// Linear scan for the widget with `id`; first match wins.
    pub fn find_by_id(&self, id: WidgetId) -> Option<WidgetHandle> {
        self.widgets.iter().find(|w| w.id() == id).cloned()
    }

    /// Widgets attached to `port`, in attach order.  Unknown ports yield an
    /// empty list.
    pub fn widgets_on_port(&self, port: &str) -> Vec<WidgetHandle> {
        self.ports
            .get(port)
            .map(|ids| ids.iter().filter_map(|id| self.find_by_id(*id)).collect())
            .unwrap_or_default()
    }

    /// Append `id` to the bucket of `port`.
    ///
    /// # Errors
    ///
    /// - [`PollError::UnknownWidget`] if `id` was never registered.
    /// - [`PollError::PortMismatch`] if `port` differs from the widget's
    ///   configured port name.
    /// - [`PollError::AlreadyAttached`] if the widget is already attached,
    ///   whether or not its slave connection has been opened since.
    pub fn attach(&mut self, id: WidgetId, port: &str) -> Result<(), PollError> {
        let handle = self.find_by_id(id).ok_or(PollError::UnknownWidget(id))?;
        let mut widget = handle.lock();

        if let Some(existing) = widget.attached_port() {
            warn!(widget = %id, port = %existing, "rejecting second attach");
            return Err(PollError::AlreadyAttached {
                widget: id,
                port: existing.to_string(),
            });
        }
        if widget.meta().port_name != port {
            return Err(PollError::PortMismatch {
                widget: id,
                expected: widget.meta().port_name.clone(),
                requested: port.to_string(),
            });
        }

        widget.mark_attached(port);
        self.ports.entry(port.to_string()).or_default().push(id);
        debug!(widget = %id, port = %port, "widget attached");
        Ok(())
    }

    /// Names of every port with at least one attached widget, sorted.
    pub fn port_names(&self) -> Vec<String> {
        self.ports
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Port → attached widget ids, ports sorted by name.
    pub fn ports(&self) -> impl Iterator<Item = (&str, &[WidgetId])> {
        self.ports
            .iter()
            .map(|(name, ids)| (name.as_str(), ids.as_slice()))
    }

    /// Every registered widget in registration order.
    pub fn widgets(&self) -> &[WidgetHandle] {
        &self.widgets
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    /// Deliver `command` to every registered widget in registration order.
    ///
    /// Failures are collected per widget; one failing widget never stops
    /// delivery to the rest.
    pub fn broadcast(&self, command: WidgetCommand) -> Vec<(WidgetId, PollError)> {
        self.widgets
            .iter()
            .filter_map(|handle| {
                handle
                    .lock()
                    .dispatch(command)
                    .err()
                    .map(|e| (handle.id(), e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use buspoll_types::WidgetMeta;

    use super::*;
    use crate::sim::{SimConnector, Waveform};

    fn widget(name: &str, port: &str) -> Widget {
        let connector = Arc::new(SimConnector::new(Waveform::Constant(0.0)));
        Widget::new(
            WidgetMeta {
                name: name.to_string(),
                port_name: port.to_string(),
                ..WidgetMeta::default()
            },
            connector,
        )
    }

    #[test]
    fn widgets_on_port_preserve_attach_order() {
        let mut registry = Registry::new();
        let w1 = registry.register_and_attach(widget("w1", "A")).unwrap();
        let w3 = registry.register_and_attach(widget("w3", "B")).unwrap();
        let w2 = registry.register_and_attach(widget("w2", "A")).unwrap();

        let on_a: Vec<WidgetId> = registry.widgets_on_port("A").iter().map(|h| h.id()).collect();
        assert_eq!(on_a, vec![w1.id(), w2.id()]);
        let on_b: Vec<WidgetId> = registry.widgets_on_port("B").iter().map(|h| h.id()).collect();
        assert_eq!(on_b, vec![w3.id()]);
        assert_eq!(registry.port_names(), vec!["A".to_string(), "B".to_string()]);

        let ports: Vec<(&str, usize)> = registry.ports().map(|(name, ids)| (name, ids.len())).collect();
        assert_eq!(ports, [("A", 2), ("B", 1)]);
    }

    #[test]
    fn unknown_port_is_empty() {
        let registry = Registry::new();
        assert!(registry.widgets_on_port("/dev/none").is_empty());
    }

    #[test]
    fn find_by_id_returns_registered_handle() {
        let mut registry = Registry::new();
        let handle = registry.register(widget("w1", "A"));
        let found = registry.find_by_id(handle.id()).unwrap();
        assert!(found.ptr_eq(&handle));
        assert!(registry.find_by_id(WidgetId::new()).is_none());
    }

    #[test]
    fn registered_but_unattached_widget_has_no_port() {
        let mut registry = Registry::new();
        registry.register(widget("w1", "A"));
        assert_eq!(registry.len(), 1);
        assert!(registry.port_names().is_empty());
    }

    #[test]
    fn attach_unknown_widget_fails() {
        let mut registry = Registry::new();
        let result = registry.attach(WidgetId::new(), "A");
        assert!(matches!(result, Err(PollError::UnknownWidget(_))));
    }

    #[test]
    fn attach_to_wrong_port_fails() {
        let mut registry = Registry::new();
        let handle = registry.register(widget("w1", "A"));
        let result = registry.attach(handle.id(), "B");
        assert!(matches!(result, Err(PollError::PortMismatch { .. })));
        assert!(registry.widgets_on_port("B").is_empty());
    }

    #[test]
    fn second_attach_is_rejected() {
        let mut registry = Registry::new();
        let handle = registry.register_and_attach(widget("w1", "A")).unwrap();
        let result = registry.attach(handle.id(), "A");
        assert!(matches!(result, Err(PollError::AlreadyAttached { .. })));
        assert_eq!(registry.widgets_on_port("A").len(), 1);
    }

    #[test]
    fn reattach_after_initialization_is_rejected() {
        let mut registry = Registry::new();
        let handle = registry.register_and_attach(widget("w1", "A")).unwrap();
        assert!(registry.broadcast(WidgetCommand::InitializeSlave).is_empty());
        assert!(handle.lock().is_initialized());

        let result = registry.attach(handle.id(), "A");
        assert!(matches!(result, Err(PollError::AlreadyAttached { .. })));
        assert_eq!(registry.widgets_on_port("A").len(), 1);
    }

    #[test]
    fn broadcast_collects_failures_and_continues() {
        let mut registry = Registry::new();
        let broken = Arc::new(SimConnector::new(Waveform::Constant(0.0)).failing_open("busy"));
        let bad = registry
            .register_and_attach(Widget::new(
                WidgetMeta {
                    port_name: "A".to_string(),
                    ..WidgetMeta::default()
                },
                broken,
            ))
            .unwrap();
        let good = registry.register_and_attach(widget("ok", "A")).unwrap();

        let failures = registry.broadcast(WidgetCommand::InitializeSlave);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, bad.id());
        assert!(good.lock().is_initialized());
        assert!(!bad.lock().is_initialized());
    }
}
