//! Repository interface shared by the in-memory and Postgres stores.

use crate::error::Result;
use crate::models::{
    ListPlansFilter, Plan, PlanFeature, PlanModule, Subscription, SubscriptionQuery, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Read-modify-write step applied to a usage entry while the store holds it
/// exclusively. Returning `Ok(None)` leaves the entry untouched; an error
/// aborts the write.
pub type UsageMutation =
    Box<dyn FnOnce(Option<UsageRecord>) -> Result<Option<UsageRecord>> + Send>;

/// Read-modify-write step applied to the stored subscription row while the
/// store holds it exclusively. The row is passed as stored, soft-deleted or
/// not; an error aborts the write.
pub type SubscriptionMutation =
    Box<dyn FnOnce(Subscription) -> Result<SubscriptionWrite> + Send>;

/// What happens to the subscriber's other active subscriptions when an
/// active row is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingPolicy {
    /// Flip `is_active` to false.
    Deactivate,
    /// Cancel immediately at the write instant.
    CancelImmediately,
}

/// A write of one subscription row.
///
/// When the row is active (`is_active` and not deleted), every other active
/// row of the same subscriber is handled per `siblings` inside the same
/// atomic unit. `clear_usage` deletes the row's usage entries in that unit.
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub subscription: Subscription,
    pub siblings: SiblingPolicy,
    pub clear_usage: bool,
}

impl SubscriptionWrite {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            siblings: SiblingPolicy::Deactivate,
            clear_usage: false,
        }
    }

    pub fn canceling_siblings(mut self) -> Self {
        self.siblings = SiblingPolicy::CancelImmediately;
        self
    }

    pub fn clearing_usage(mut self) -> Self {
        self.clear_usage = true;
        self
    }
}

/// Result of a [`SubscriptionWrite`].
#[derive(Debug, Clone)]
pub struct SavedSubscription {
    pub subscription: Subscription,
    /// Siblings that were deactivated or canceled by the write.
    pub deactivated: Vec<Subscription>,
}

/// Result of removing a plan.
#[derive(Debug, Clone)]
pub struct PlanRemoval {
    pub plan: Plan,
    /// Subscriptions soft-deleted along with the plan.
    pub subscriptions: Vec<Subscription>,
}

/// Storage for plans, features, subscriptions and the usage ledger.
///
/// Every method that touches more than one row is atomic.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert_plan(&self, plan: Plan) -> Result<Plan>;

    /// Soft-deleted plans are not returned.
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>>;

    /// Oldest live plan with the slug.
    async fn get_plan_by_slug(&self, slug: &str) -> Result<Option<Plan>>;

    /// Ordered by `sort_order`, then name.
    async fn list_plans(&self, filter: ListPlansFilter) -> Result<Vec<Plan>>;

    async fn set_plan_active(
        &self,
        plan_id: Uuid,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>>;

    /// Soft-deletes the plan and its subscriptions; removes its features,
    /// its modules and every usage entry and add-on quantity attached to them.
    async fn delete_plan(&self, plan_id: Uuid, now: DateTime<Utc>) -> Result<Option<PlanRemoval>>;

    /// Fails with `DuplicateFeatureSlug` when the plan already has the slug.
    async fn insert_feature(&self, feature: PlanFeature) -> Result<PlanFeature>;

    async fn get_feature(&self, plan_id: Uuid, slug: &str) -> Result<Option<PlanFeature>>;

    /// Ordered by `sort_order`, then slug.
    async fn list_features(&self, plan_id: Uuid) -> Result<Vec<PlanFeature>>;

    /// Removes the feature with its usage entries and add-on quantities.
    async fn delete_feature(&self, feature_id: Uuid) -> Result<bool>;

    /// Returns the existing row when the plan already has the module.
    async fn insert_module(&self, module: PlanModule) -> Result<PlanModule>;

    /// Ordered by module name.
    async fn list_modules(&self, plan_id: Uuid) -> Result<Vec<PlanModule>>;

    async fn delete_module(&self, plan_id: Uuid, module: &str) -> Result<bool>;

    /// Includes soft-deleted rows.
    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>>;

    /// Ordered by creation time.
    async fn find_subscriptions(
        &self,
        query: &SubscriptionQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>>;

    /// Store a new subscription row.
    async fn insert_subscription(&self, write: SubscriptionWrite) -> Result<SavedSubscription>;

    /// Apply `mutation` to the current row and write the result in one
    /// atomic unit. `Ok(None)` when no row has the id.
    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        mutation: SubscriptionMutation,
    ) -> Result<Option<SavedSubscription>>;

    async fn get_usage(&self, subscription_id: Uuid, feature_id: Uuid)
        -> Result<Option<UsageRecord>>;

    async fn list_usage(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>>;

    /// Atomic per (subscription, feature). Fails with `InvalidState` when
    /// the subscription is missing or soft-deleted at write time, so no entry
    /// outlives a deleted subscription.
    async fn mutate_usage(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        mutation: UsageMutation,
    ) -> Result<Option<UsageRecord>>;

    /// Entries whose `valid_until` is at or before `now`.
    async fn find_expired_usage(&self, now: DateTime<Utc>) -> Result<Vec<UsageRecord>>;

    /// Purchased add-on quantity; zero when nothing was purchased.
    async fn additional_quantity(&self, subscription_id: Uuid, feature_id: Uuid) -> Result<i64>;

    async fn set_additional_quantity(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<()>;
}
