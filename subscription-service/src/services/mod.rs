//! Services module for subscription-service.

pub mod catalog;
pub mod clock;
pub mod database;
pub mod events;
pub mod feature_manager;
pub mod memory;
pub mod metrics;
pub mod quota;
pub mod store;
pub mod subscriptions;

pub use catalog::PlanCatalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::Database;
pub use events::{EventBus, SubscriptionEvent};
pub use feature_manager::{
    FeatureCounter, FeatureManagerConfig, FeatureUsageManager, SubscriberResolver,
};
pub use memory::InMemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_quota_decision, record_subscription_operation,
    record_usage_operation,
};
pub use quota::QuotaEngine;
pub use store::{
    PlanRemoval, SavedSubscription, SiblingPolicy, SubscriptionMutation, SubscriptionStore,
    SubscriptionWrite, UsageMutation,
};
pub use subscriptions::SubscriptionService;
