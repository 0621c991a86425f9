//! Events carried on the hub event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// Payload types that know which event type they are published under
pub trait EventData: Clone + Send + Sync + 'static {
    /// The event type string for this payload
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The wildcard type that subscribes to everything
    pub fn match_all() -> Self {
        Self(crate::MATCH_ALL.to_string())
    }

    pub fn is_match_all(&self) -> bool {
        self.0 == crate::MATCH_ALL
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event fired on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,

    pub data: T,

    pub origin: EventOrigin,

    pub time_fired: DateTime<Utc>,

    /// Causal context of whatever fired the event
    pub context: Context,
}

impl<T> Event<T> {
    /// Create a local event stamped with the current time
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: EventOrigin::Local,
            time_fired: Utc::now(),
            context,
        }
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Replace the payload, keeping type, origin, time and context
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        Event {
            event_type: self.event_type,
            data: f(self.data),
            origin: self.origin,
            time_fired: self.time_fired,
            context: self.context,
        }
    }
}

impl<T: EventData> Event<T> {
    /// Create an event whose type comes from its payload
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}

/// Where an event came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    #[default]
    Local,
    /// Received from a client connection
    Remote,
}
