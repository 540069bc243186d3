//! Domain models for subscription-service.

mod feature;
mod module;
mod period;
mod plan;
mod subscriber;
mod subscription;
mod usage;

pub use feature::{CreateFeature, PlanFeature, Quota, UNLIMITED};
pub use module::PlanModule;
pub use period::{Interval, Period};
pub use plan::{BillingType, CreatePlan, ListPlansFilter, Plan};
pub use subscriber::{Subscriber, SubscriberRef};
pub use subscription::{
    look_ahead, NewSubscription, Subscription, SubscriptionQuery, SubscriptionState,
    DEFAULT_DAY_RANGE,
};
pub use usage::{QuotaStatus, UsageRecord};
