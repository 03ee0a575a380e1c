//! `buspoll-middleware` – the result channel.
//!
//! Carries samples, faults, and lifecycle changes from port schedulers to
//! whoever renders or records them, without the schedulers knowing who is
//! listening.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
