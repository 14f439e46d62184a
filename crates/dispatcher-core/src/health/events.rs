//! Destination up/down notifications
//!
//! When a destination changes between usable and unusable, the dispatcher
//! runs the `dispatcher:dst-up` or `dispatcher:dst-down` route of the
//! configured [`EventRouter`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::SetId;

/// Usability change of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationEvent {
    Up,
    Down,
}

impl DestinationEvent {
    /// Name of the route run for this event
    pub fn route_name(&self) -> &'static str {
        match self {
            DestinationEvent::Up => "dispatcher:dst-up",
            DestinationEvent::Down => "dispatcher:dst-down",
        }
    }
}

impl fmt::Display for DestinationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationEvent::Up => f.write_str("up"),
            DestinationEvent::Down => f.write_str("down"),
        }
    }
}

/// Receiver of destination events
pub trait EventRouter: Send + Sync {
    fn run(&self, event: DestinationEvent, group: SetId, target_uri: &str);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventRouter;

impl EventRouter for NoopEventRouter {
    fn run(&self, _event: DestinationEvent, _group: SetId, _target_uri: &str) {}
}

/// An event as delivered to broadcast subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationNotification {
    pub route: String,
    pub event: DestinationEvent,
    pub group: SetId,
    pub uri: String,
}

/// Publishes events on a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastEventRouter {
    sender: broadcast::Sender<DestinationNotification>,
}

impl BroadcastEventRouter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DestinationNotification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventRouter {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventRouter for BroadcastEventRouter {
    fn run(&self, event: DestinationEvent, group: SetId, target_uri: &str) {
        let notification = DestinationNotification {
            route: event.route_name().to_string(),
            event,
            group,
            uri: target_uri.to_string(),
        };
        // no subscribers is fine
        if self.sender.send(notification).is_err() {
            debug!("no listener for {} of {}", event.route_name(), target_uri);
        }
    }
}
