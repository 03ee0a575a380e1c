use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque, process-unique identity of a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WidgetId(Uuid);

impl WidgetId {
    /// Allocate a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WidgetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration of a widget, consumed when its slave connection is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetMeta {
    /// Device family, e.g. `"sim"` or a vendor controller name.
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,
    /// Display name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Engineering unit shown next to the value, e.g. `"[C]"`.
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Channel index on the device.
    #[serde(default)]
    pub channel: u8,
    /// Name of the physical bus, e.g. `"/dev/ttyUSB0"`.
    #[serde(default = "default_port_name")]
    pub port_name: String,
    /// Address of the unit on the bus.
    #[serde(default = "default_slave_address")]
    pub slave_address: u8,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_device_type() -> String {
    "Dummy".to_string()
}
fn default_name() -> String {
    "Top".to_string()
}
fn default_unit() -> String {
    "[C]".to_string()
}
fn default_port_name() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_slave_address() -> u8 {
    1
}
fn default_baud_rate() -> u32 {
    19200
}

impl Default for WidgetMeta {
    fn default() -> Self {
        Self {
            device_type: default_device_type(),
            name: default_name(),
            unit: default_unit(),
            channel: 0,
            port_name: default_port_name(),
            slave_address: default_slave_address(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// One successful reading taken by a port scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub widget: WidgetId,
    pub port: String,
    pub name: String,
    pub unit: String,
    pub value: f64,
    /// Seconds since the owning scheduler started.
    pub elapsed_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// How a sampling failure is handled by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Link hiccup; logged and retried next cycle.
    Transient,
    /// Malformed or unexpected response; counts towards escalation.
    Protocol,
    /// Unrecoverable; terminates the port's scheduler.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Protocol => write!(f, "protocol"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// State of a port as rendered by a host status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    /// Known but no scheduler running yet.
    Idle,
    Sampling,
    /// Running, but a widget is unhealthy or the cycle heartbeat is late.
    Degraded,
    /// Scheduler terminated on an error.
    Failed,
    /// Scheduler exited after cancellation.
    Stopped,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Idle => write!(f, "idling"),
            PortState::Sampling => write!(f, "sampling"),
            PortState::Degraded => write!(f, "degraded"),
            PortState::Failed => write!(f, "failed"),
            PortState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Envelope for everything published on the result channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "buspoll-runtime::scheduler"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed from schedulers to status sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Sample(Sample),
    SampleFailed {
        widget: WidgetId,
        port: String,
        class: ErrorClass,
        message: String,
    },
    HandlerFailed {
        widget: WidgetId,
        port: String,
        /// Position of the handler in the widget's event list.
        handler: usize,
        message: String,
    },
    WidgetDegraded {
        widget: WidgetId,
        port: String,
        consecutive_failures: u32,
    },
    PortStateChanged {
        port: String,
        state: PortState,
    },
    SchedulerExited {
        port: String,
        reason: String,
    },
}

impl EventPayload {
    /// Port the event originated from.
    pub fn port(&self) -> &str {
        match self {
            EventPayload::Sample(sample) => &sample.port,
            EventPayload::SampleFailed { port, .. }
            | EventPayload::HandlerFailed { port, .. }
            | EventPayload::WidgetDegraded { port, .. }
            | EventPayload::PortStateChanged { port, .. }
            | EventPayload::SchedulerExited { port, .. } => port,
        }
    }
}

/// Error type shared by every buspoll crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PollError {
    #[error("Connection to {port} failed: {details}")]
    Connection { port: String, details: String },

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Fatal device error: {0}")]
    Fatal(String),

    #[error("Widget {0} has no slave connection")]
    NotInitialized(WidgetId),

    #[error("Widget {0} is not registered")]
    UnknownWidget(WidgetId),

    #[error("Widget {widget} belongs to port {expected}, not {requested}")]
    PortMismatch {
        widget: WidgetId,
        expected: String,
        requested: String,
    },

    #[error("Widget {widget} is already attached to port {port}")]
    AlreadyAttached { widget: WidgetId, port: String },

    #[error("Configuration of widget {0} is locked while its slave connection is open")]
    ConfigLocked(WidgetId),

    #[error("Widget {widget} escalated after {failures} consecutive failures: {last_error}")]
    Escalated {
        widget: WidgetId,
        failures: u32,
        last_error: String,
    },

    #[error("Event handler failed: {0}")]
    Handler(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn scheduler for port {port}: {details}")]
    Spawn { port: String, details: String },
}

impl PollError {
    /// Classification used by the scheduler's sample phase.
    pub fn class(&self) -> ErrorClass {
        match self {
            PollError::TransientIo(_) | PollError::Connection { .. } => ErrorClass::Transient,
            PollError::Protocol(_) => ErrorClass::Protocol,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<std::io::Error> for PollError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::UnexpectedEof => PollError::TransientIo(e.to_string()),
            ErrorKind::InvalidData => PollError::Protocol(e.to_string()),
            _ => PollError::Fatal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_ids_are_unique() {
        let a = WidgetId::new();
        let b = WidgetId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn meta_defaults_match_dummy_device() {
        let meta = WidgetMeta::default();
        assert_eq!(meta.device_type, "Dummy");
        assert_eq!(meta.port_name, "/dev/ttyUSB0");
        assert_eq!(meta.slave_address, 1);
        assert_eq!(meta.baud_rate, 19200);
    }

    #[test]
    fn meta_deserializes_with_partial_fields() {
        let json = r#"{"type":"sim","name":"Inlet","port_name":"/dev/ttyUSB1"}"#;
        let meta: WidgetMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.device_type, "sim");
        assert_eq!(meta.name, "Inlet");
        assert_eq!(meta.port_name, "/dev/ttyUSB1");
        assert_eq!(meta.unit, "[C]");
        assert_eq!(meta.baud_rate, 19200);
    }

    #[test]
    fn event_roundtrip() {
        let widget = WidgetId::new();
        let event = Event::new(
            "buspoll-runtime::scheduler",
            EventPayload::Sample(Sample {
                widget,
                port: "A".to_string(),
                name: "Top".to_string(),
                unit: "[C]".to_string(),
                value: 21.5,
                elapsed_secs: 0.5,
                timestamp: Utc::now(),
            }),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        match back.payload {
            EventPayload::Sample(s) => {
                assert_eq!(s.widget, widget);
                assert!((s.value - 21.5).abs() < f64::EPSILON);
            }
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn error_classes() {
        assert_eq!(PollError::TransientIo("x".into()).class(), ErrorClass::Transient);
        assert_eq!(PollError::Protocol("crc".into()).class(), ErrorClass::Protocol);
        assert_eq!(PollError::Fatal("gone".into()).class(), ErrorClass::Fatal);
        assert_eq!(
            PollError::NotInitialized(WidgetId::new()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn io_errors_are_classified_by_kind() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply");
        assert_eq!(PollError::from(timeout).class(), ErrorClass::Transient);

        let garbled = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad crc");
        assert_eq!(PollError::from(garbled).class(), ErrorClass::Protocol);

        let unplugged = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        assert_eq!(PollError::from(unplugged).class(), ErrorClass::Fatal);
    }

    #[test]
    fn poll_error_display() {
        let err = PollError::Connection {
            port: "/dev/ttyUSB0".to_string(),
            details: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/dev/ttyUSB0"));
        assert_eq!(PortState::Idle.to_string(), "idling");
    }
}
