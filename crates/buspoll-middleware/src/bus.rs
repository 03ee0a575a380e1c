//! Typed, topic-based result channel from port schedulers to status sinks.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! a scheduler.  Publishing never fails and never blocks: with no subscriber
//! the event is simply dropped, and a slow subscriber loses the oldest events
//! (it sees `Lagged`).
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Samples`] | One event per successful read |
//! | [`Topic::Faults`] | Failed reads, failed event handlers, degraded widgets |
//! | [`Topic::Lifecycle`] | Port state changes, scheduler exits |
//!
//! Every event is also copied to a global channel ([`EventBus::subscribe`])
//! for sinks that want everything.

use buspoll_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 1024;

/// Routing lanes of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Samples,
    Faults,
    Lifecycle,
}

impl Topic {
    /// Lane an event payload belongs to.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::Sample(_) => Topic::Samples,
            EventPayload::SampleFailed { .. }
            | EventPayload::HandlerFailed { .. }
            | EventPayload::WidgetDegraded { .. } => Topic::Faults,
            EventPayload::PortStateChanged { .. } | EventPayload::SchedulerExited { .. } => {
                Topic::Lifecycle
            }
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    samples: broadcast::Sender<Event>,
    faults: broadcast::Sender<Event>,
    lifecycle: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (samples, _) = broadcast::channel(capacity);
        let (faults, _) = broadcast::channel(capacity);
        let (lifecycle, _) = broadcast::channel(capacity);
        Self {
            all,
            samples,
            faults,
            lifecycle,
        }
    }

    /// Publish `event` on the lane matching its payload and on the global
    /// channel.
    ///
    /// Returns the number of receivers handed the event; `0` when nobody is
    /// listening, which is a normal condition.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        let on_topic = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        let on_all = self.all.send(event).unwrap_or(0);
        if on_topic + on_all == 0 {
            trace!(?topic, "no subscribers; event dropped");
        }
        on_topic + on_all
    }

    /// Subscribe to a single [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event on the global channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Samples => &self.samples,
            Topic::Faults => &self.faults,
            Topic::Lifecycle => &self.lifecycle,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Blocking variant of [`TopicReceiver::recv`] for plain threads.
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.blocking_recv()
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }
}
