use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{AmenityKind, Booking};

const CHANNEL_CAPACITY: usize = 256;

/// Booking lifecycle change, published after the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingEvent {
    Created(Booking),
    Updated(Booking),
    Removed { kind: AmenityKind, id: Ulid },
}

impl BookingEvent {
    pub fn kind(&self) -> AmenityKind {
        match self {
            BookingEvent::Created(b) | BookingEvent::Updated(b) => b.kind,
            BookingEvent::Removed { kind, .. } => *kind,
        }
    }
}

/// Broadcast hub for booking events per amenity kind.
pub struct NotifyHub {
    channels: DashMap<AmenityKind, broadcast::Sender<BookingEvent>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for an amenity kind. Creates the channel if needed.
    pub fn subscribe(&self, kind: AmenityKind) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(kind)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, event: &BookingEvent) {
        if let Some(sender) = self.channels.get(&event.kind()) {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
