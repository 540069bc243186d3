//! Subscriber identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged reference to the entity that owns subscriptions, such as a user
/// or a company.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberRef {
    pub kind: String,
    pub id: String,
}

impl SubscriberRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for SubscriberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Capability implemented by any type that can hold subscriptions.
pub trait Subscriber: Send + Sync {
    fn subscriber_ref(&self) -> SubscriberRef;
}

impl Subscriber for SubscriberRef {
    fn subscriber_ref(&self) -> SubscriberRef {
        self.clone()
    }
}
