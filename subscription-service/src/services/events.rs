//! Lifecycle signals for cache invalidation and notifications.

use crate::models::Subscription;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// Signal published after a state change has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Created(Subscription),
    Updated(Subscription),
    Deleted(Subscription),
    Restored(Subscription),
    UsageReset {
        subscription_id: Uuid,
        feature_id: Uuid,
    },
}

impl SubscriptionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionEvent::Created(_) => "subscription_created",
            SubscriptionEvent::Updated(_) => "subscription_updated",
            SubscriptionEvent::Deleted(_) => "subscription_deleted",
            SubscriptionEvent::Restored(_) => "subscription_restored",
            SubscriptionEvent::UsageReset { .. } => "usage_reset",
        }
    }
}

/// Broadcast channel for [`SubscriptionEvent`]s. Publishing never blocks and
/// never fails; events are dropped when nobody is subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SubscriptionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SubscriptionEvent) {
        tracing::debug!(event = event.name(), "Publishing subscription event");
        let _ = self.sender.send(event);
    }
}
