//! Subscription state machine.

use crate::error::{Result, SubscriptionError};
use crate::models::{NewSubscription, Plan, Subscriber, Subscription, SubscriptionQuery};
use crate::services::clock::Clock;
use crate::services::events::{EventBus, SubscriptionEvent};
use crate::services::metrics::{record_error, record_subscription_operation};
use crate::services::store::{SavedSubscription, SubscriptionStore, SubscriptionWrite};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Creates and transitions subscriptions while keeping at most one active
/// subscription per subscriber.
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to a plan. Any subscription the subscriber already has
    /// active is canceled immediately in the same atomic write.
    #[instrument(skip(self, input), fields(subscriber = %input.subscriber, plan_id = %plan_id))]
    pub async fn create(&self, input: NewSubscription, plan_id: Uuid) -> Result<Subscription> {
        let plan = self.plan(plan_id).await?;
        let now = self.clock.now();
        let subscription = Subscription::start(input, &plan, now)?;

        let saved = self
            .store
            .insert_subscription(SubscriptionWrite::new(subscription).canceling_siblings())
            .await
            .inspect_err(|e| record_error(e.kind(), "create"))?;

        info!(
            subscription_id = %saved.subscription.subscription_id,
            trial_ends_at = ?saved.subscription.trial_ends_at,
            ends_at = ?saved.subscription.ends_at,
            replaced = saved.deactivated.len(),
            "Subscription created"
        );
        record_subscription_operation("create");
        Ok(self.publish(saved, SubscriptionEvent::Created))
    }

    /// Cancel now or at the end of the billing period. Safe to repeat.
    #[instrument(skip(self))]
    pub async fn cancel(&self, subscription_id: Uuid, immediately: bool) -> Result<Subscription> {
        let now = self.clock.now();
        let saved = self
            .update(subscription_id, "cancel", move |subscription| {
                let mut subscription = live(subscription)?;
                subscription.cancel(now, immediately);
                Ok(SubscriptionWrite::new(subscription))
            })
            .await?;

        info!(
            subscription_id = %subscription_id,
            ends_at = ?saved.subscription.ends_at,
            "Subscription canceled"
        );
        record_subscription_operation("cancel");
        Ok(self.publish(saved, SubscriptionEvent::Updated))
    }

    /// Start a fresh billing period at the current instant and clear usage.
    #[instrument(skip(self))]
    pub async fn renew(&self, subscription_id: Uuid) -> Result<Subscription> {
        let plan = self.plan(self.get(subscription_id).await?.plan_id).await?;
        let now = self.clock.now();
        let window = plan.billing_window(now)?;

        let saved = self
            .update(subscription_id, "renew", move |subscription| {
                let mut subscription = on_plan(live(subscription)?, &plan)?;
                subscription.ensure_renewable(now)?;
                subscription.set_period(&window);
                subscription.canceled_at = None;
                subscription.cancels_at = None;
                subscription.is_active = true;
                subscription.updated_utc = now;
                Ok(SubscriptionWrite::new(subscription).clearing_usage())
            })
            .await?;

        info!(
            subscription_id = %subscription_id,
            ends_at = ?saved.subscription.ends_at,
            "Subscription renewed"
        );
        record_subscription_operation("renew");
        Ok(self.publish(saved, SubscriptionEvent::Updated))
    }

    /// Move to another plan. A different billing cadence starts a new
    /// billing period at the current instant and discards usage.
    #[instrument(skip(self))]
    pub async fn change_plan(&self, subscription_id: Uuid, plan_id: Uuid) -> Result<Subscription> {
        let current = self.plan(self.get(subscription_id).await?.plan_id).await?;
        let next = self.plan(plan_id).await?;
        let now = self.clock.now();
        let new_cycle = if current.same_billing_cadence(&next) {
            None
        } else {
            Some(next.billing_window(now)?)
        };

        let (from_plan, to_plan) = (current.plan_id, next.plan_id);
        let starts_cycle = new_cycle.is_some();
        let saved = self
            .update(subscription_id, "change_plan", move |subscription| {
                let mut subscription = on_plan(live(subscription)?, &current)?;
                subscription.plan_id = next.plan_id;
                subscription.billing_type = next.billing_type.clone();
                subscription.updated_utc = now;
                match new_cycle {
                    Some(window) => {
                        subscription.set_period(&window);
                        Ok(SubscriptionWrite::new(subscription).clearing_usage())
                    }
                    None => Ok(SubscriptionWrite::new(subscription)),
                }
            })
            .await?;

        info!(
            subscription_id = %subscription_id,
            from_plan = %from_plan,
            to_plan = %to_plan,
            new_cycle = starts_cycle,
            "Subscription plan changed"
        );
        record_subscription_operation("change_plan");
        Ok(self.publish(saved, SubscriptionEvent::Updated))
    }

    /// Flip `is_active` on. Other active subscriptions of the subscriber are
    /// deactivated in the same atomic write.
    #[instrument(skip(self))]
    pub async fn activate(&self, subscription_id: Uuid) -> Result<Subscription> {
        let now = self.clock.now();
        let saved = self
            .update(subscription_id, "activate", move |subscription| {
                let mut subscription = live(subscription)?;
                subscription.is_active = true;
                subscription.updated_utc = now;
                Ok(SubscriptionWrite::new(subscription))
            })
            .await?;

        info!(subscription_id = %subscription_id, "Subscription activated");
        record_subscription_operation("activate");
        Ok(self.publish(saved, SubscriptionEvent::Updated))
    }

    #[instrument(skip(self))]
    pub async fn mark_paid(&self, subscription_id: Uuid, is_paid: bool) -> Result<Subscription> {
        let now = self.clock.now();
        let saved = self
            .update(subscription_id, "mark_paid", move |subscription| {
                let mut subscription = live(subscription)?;
                subscription.is_paid = is_paid;
                subscription.updated_utc = now;
                Ok(SubscriptionWrite::new(subscription))
            })
            .await?;

        record_subscription_operation("mark_paid");
        Ok(self.publish(saved, SubscriptionEvent::Updated))
    }

    /// Soft-delete the subscription and drop its usage entries.
    #[instrument(skip(self))]
    pub async fn delete(&self, subscription_id: Uuid) -> Result<Subscription> {
        let now = self.clock.now();
        let saved = self
            .update(subscription_id, "delete", move |subscription| {
                let mut subscription = live(subscription)?;
                subscription.deleted_utc = Some(now);
                subscription.updated_utc = now;
                Ok(SubscriptionWrite::new(subscription).clearing_usage())
            })
            .await?;

        info!(subscription_id = %subscription_id, "Subscription deleted");
        record_subscription_operation("delete");
        Ok(self.publish(saved, SubscriptionEvent::Deleted))
    }

    /// Undo a soft delete. A restored active subscription takes over from
    /// any other active subscription of the subscriber.
    #[instrument(skip(self))]
    pub async fn restore(&self, subscription_id: Uuid) -> Result<Subscription> {
        let now = self.clock.now();
        let saved = self
            .update(subscription_id, "restore", move |mut subscription| {
                if !subscription.is_deleted() {
                    return Err(SubscriptionError::InvalidState(format!(
                        "subscription {} is not deleted",
                        subscription.subscription_id
                    )));
                }
                subscription.deleted_utc = None;
                subscription.updated_utc = now;
                Ok(SubscriptionWrite::new(subscription))
            })
            .await?;

        info!(subscription_id = %subscription_id, "Subscription restored");
        record_subscription_operation("restore");
        Ok(self.publish(saved, SubscriptionEvent::Restored))
    }

    /// Subscription by id; soft-deleted subscriptions are `NotFound`.
    pub async fn get(&self, subscription_id: Uuid) -> Result<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| not_found(subscription_id))
    }

    /// The subscriber's single active subscription, always read from the store.
    pub async fn active_subscription(
        &self,
        subscriber: &dyn Subscriber,
    ) -> Result<Option<Subscription>> {
        Ok(self.active_subscriptions(subscriber).await?.pop())
    }

    pub async fn subscriptions(
        &self,
        subscriber: &dyn Subscriber,
    ) -> Result<Vec<Subscription>> {
        self.find(SubscriptionQuery::OfSubscriber(subscriber.subscriber_ref()))
            .await
    }

    pub async fn active_subscriptions(
        &self,
        subscriber: &dyn Subscriber,
    ) -> Result<Vec<Subscription>> {
        let mut subscriptions = self.subscriptions(subscriber).await?;
        subscriptions.retain(|s| s.active());
        Ok(subscriptions)
    }

    pub async fn has_active_subscription(
        &self,
        subscriber: &dyn Subscriber,
    ) -> Result<bool> {
        Ok(self.active_subscription(subscriber).await?.is_some())
    }

    /// Whether the subscriber's active subscription is on `plan_id`.
    pub async fn subscribed_to(
        &self,
        subscriber: &dyn Subscriber,
        plan_id: Uuid,
    ) -> Result<bool> {
        Ok(self
            .active_subscriptions(subscriber)
            .await?
            .iter()
            .any(|s| s.plan_id == plan_id))
    }

    /// Plans of the subscriber's active subscriptions.
    pub async fn subscribed_plans(
        &self,
        subscriber: &dyn Subscriber,
    ) -> Result<Vec<Plan>> {
        let mut plans = Vec::new();
        for subscription in self.active_subscriptions(subscriber).await? {
            if let Some(plan) = self.store.get_plan(subscription.plan_id).await? {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    /// The subscriber's subscription with the given name; the oldest wins
    /// when several share it.
    pub async fn subscription_named(
        &self,
        subscriber: &dyn Subscriber,
        name: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .subscriptions(subscriber)
            .await?
            .into_iter()
            .find(|s| s.name == name))
    }

    /// Whether the plan of the subscriber's active subscription includes
    /// `module`. False without an active subscription.
    #[instrument(skip(self, subscriber), fields(subscriber = %subscriber.subscriber_ref()))]
    pub async fn module_enabled(&self, subscriber: &dyn Subscriber, module: &str) -> Result<bool> {
        let Some(subscription) = self.active_subscription(subscriber).await? else {
            return Ok(false);
        };
        Ok(self
            .store
            .list_modules(subscription.plan_id)
            .await?
            .iter()
            .any(|m| m.module == module))
    }

    pub async fn find(&self, query: SubscriptionQuery) -> Result<Vec<Subscription>> {
        let now = self.clock.now();
        query
            .validate(now)
            .inspect_err(|e| record_error(e.kind(), "find"))?;
        self.store.find_subscriptions(&query, now).await
    }

    /// Read-modify-write of one row inside the store's atomic unit, so the
    /// change applies to the row as currently stored.
    async fn update<F>(
        &self,
        subscription_id: Uuid,
        operation: &'static str,
        change: F,
    ) -> Result<SavedSubscription>
    where
        F: FnOnce(Subscription) -> Result<SubscriptionWrite> + Send + 'static,
    {
        self.store
            .update_subscription(subscription_id, Box::new(change))
            .await
            .and_then(|saved| saved.ok_or_else(|| not_found(subscription_id)))
            .inspect_err(|e| record_error(e.kind(), operation))
    }

    async fn plan(&self, plan_id: Uuid) -> Result<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| SubscriptionError::NotFound(format!("plan {}", plan_id)))
    }

    /// Publish `Updated` for every displaced sibling, then the event for the
    /// written row.
    fn publish(
        &self,
        saved: SavedSubscription,
        event: fn(Subscription) -> SubscriptionEvent,
    ) -> Subscription {
        for sibling in saved.deactivated {
            info!(
                subscription_id = %sibling.subscription_id,
                replaced_by = %saved.subscription.subscription_id,
                "Sibling subscription deactivated"
            );
            self.events.publish(SubscriptionEvent::Updated(sibling));
        }
        self.events.publish(event(saved.subscription.clone()));
        saved.subscription
    }
}

fn not_found(subscription_id: Uuid) -> SubscriptionError {
    SubscriptionError::NotFound(format!("subscription {}", subscription_id))
}

fn live(subscription: Subscription) -> Result<Subscription> {
    if subscription.is_deleted() {
        return Err(not_found(subscription.subscription_id));
    }
    Ok(subscription)
}

/// Guards plan-derived changes against a plan switch that committed after
/// the plan was read.
fn on_plan(subscription: Subscription, plan: &Plan) -> Result<Subscription> {
    if subscription.plan_id != plan.plan_id {
        return Err(SubscriptionError::InvalidState(format!(
            "subscription {} moved to plan {} concurrently",
            subscription.subscription_id, subscription.plan_id
        )));
    }
    Ok(subscription)
}
