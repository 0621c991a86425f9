//! Event bus with typed pub/sub
//!
//! The bus is how the automation engine talks to the rest of the hub. Scene
//! activations are published here for scene triggers to pick up, and every
//! runner and scene lifecycle event is mirrored here for the transport layer.

use dashmap::DashMap;
use hub_core::{Context, Event, EventData, EventType};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast event bus
///
/// Events are delivered to subscribers of their exact type and to every
/// match-all subscriber. Firing with nobody listening is not an error.
pub struct EventBus {
    /// One broadcast channel per subscribed event type
    channels: DashMap<EventType, broadcast::Sender<Event>>,
    match_all: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            match_all,
            capacity,
        }
    }

    /// Subscribe to events of one type (or all, for the match-all type)
    pub fn subscribe(&self, event_type: impl Into<EventType>) -> broadcast::Receiver<Event> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        if event_type.is_match_all() {
            return self.match_all.subscribe();
        }

        self.channels
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event, receiving deserialized payloads
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::event_type()))
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.match_all.subscribe()
    }

    /// Fire an event to its type's subscribers and all match-all subscribers
    pub fn fire(&self, event: Event) {
        trace!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.channels.get(&event.event_type) {
            // A send error only means nobody is listening right now
            let _ = sender.send(event.clone());
        }
        let _ = self.match_all.send(event);
    }

    /// Serialize a typed payload and fire it
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        match serde_json::to_value(&data) {
            Ok(json) => self.fire(Event::new(T::event_type(), json, context)),
            Err(e) => warn!(event_type = T::event_type(), "Dropping unserializable event: {}", e),
        }
    }

    /// Number of event types with a channel
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that yields only events whose payload deserializes as `T`
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<Event>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Receive the next event with a well-formed payload
    ///
    /// Events whose payload does not match `T` are skipped.
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.map(|_| data));
            }
        }
    }
}

/// Thread-safe handle to the bus
pub type SharedEventBus = Arc<EventBus>;
