//! Feature usage facade: subscriber in, quota decision out.

use crate::error::{Result, SubscriptionError};
use crate::models::{Subscriber, SubscriberRef, Subscription, UNLIMITED};
use crate::services::metrics::record_quota_decision;
use crate::services::quota::QuotaEngine;
use crate::services::subscriptions::SubscriptionService;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Counts a feature's usage from a resource tracked outside the ledger,
/// such as the number of seats a team currently has.
#[async_trait]
pub trait FeatureCounter: Send + Sync {
    async fn count(&self, subscriber: &SubscriberRef) -> Result<i64>;
}

#[async_trait]
impl<F> FeatureCounter for F
where
    F: Fn(&SubscriberRef) -> i64 + Send + Sync,
{
    async fn count(&self, subscriber: &SubscriberRef) -> Result<i64> {
        Ok(self(subscriber))
    }
}

/// Produces the subscriber of the current request or session.
pub trait SubscriberResolver: Send + Sync {
    fn current(&self) -> Option<SubscriberRef>;
}

impl<F> SubscriberResolver for F
where
    F: Fn() -> Option<SubscriberRef> + Send + Sync,
{
    fn current(&self) -> Option<SubscriberRef> {
        self()
    }
}

/// Resolver and external counters owned by one [`FeatureUsageManager`].
#[derive(Clone, Default)]
pub struct FeatureManagerConfig {
    resolver: Option<Arc<dyn SubscriberResolver>>,
    counters: HashMap<String, Arc<dyn FeatureCounter>>,
}

impl fmt::Debug for FeatureManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureManagerConfig")
            .field("resolver", &self.resolver.is_some())
            .field("counters", &self.counters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FeatureManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(mut self, resolver: impl SubscriberResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_counter(mut self, slug: &str, counter: impl FeatureCounter + 'static) -> Self {
        self.counters.insert(slug.to_string(), Arc::new(counter));
        self
    }

    pub fn counter(&self, slug: &str) -> Option<&Arc<dyn FeatureCounter>> {
        self.counters.get(slug)
    }
}

/// Answers "may this subscriber use this feature" and records usage against
/// the subscriber's active subscription.
///
/// The active subscription is re-read from the store on every call.
#[derive(Clone)]
pub struct FeatureUsageManager {
    subscriptions: SubscriptionService,
    quota: QuotaEngine,
    config: FeatureManagerConfig,
}

impl FeatureUsageManager {
    pub fn new(
        subscriptions: SubscriptionService,
        quota: QuotaEngine,
        config: FeatureManagerConfig,
    ) -> Self {
        Self {
            subscriptions,
            quota,
            config,
        }
    }

    /// False when there is no subscriber or no active subscription.
    /// A registered counter is compared against the total balance;
    /// otherwise the ledger decides.
    #[instrument(skip(self, subscriber))]
    pub async fn can_use(&self, slug: &str, subscriber: Option<&SubscriberRef>) -> Result<bool> {
        let Some((subscriber, subscription)) = self.resolve(subscriber).await? else {
            return Ok(false);
        };

        let allowed = match self.config.counter(slug) {
            Some(counter) => {
                let balance = self.quota.total_feature_balance(&subscription, slug).await?;
                let count = counter.count(&subscriber).await?;
                debug!(feature = slug, balance = balance, count = count, "External counter checked");
                balance == UNLIMITED || count < balance
            }
            None => return self.quota.can_use(&subscription, slug).await,
        };

        record_quota_decision(slug, allowed);
        Ok(allowed)
    }

    /// Record usage on the active subscription. Returns false when there was
    /// nothing to record against.
    #[instrument(skip(self, subscriber))]
    pub async fn record_usage(
        &self,
        slug: &str,
        subscriber: Option<&SubscriberRef>,
        amount: i64,
    ) -> Result<bool> {
        let Some((_, subscription)) = self.resolve(subscriber).await? else {
            return Ok(false);
        };
        let recorded = self
            .quota
            .record_usage(&subscription, slug, amount, true)
            .await
            .map(|_| true);
        deleted_meanwhile(recorded, &subscription)
    }

    /// Reduce usage on the active subscription. Returns false when there was
    /// no active subscription or no usage entry.
    #[instrument(skip(self, subscriber))]
    pub async fn reduce_usage(
        &self,
        slug: &str,
        subscriber: Option<&SubscriberRef>,
        amount: i64,
    ) -> Result<bool> {
        let Some((_, subscription)) = self.resolve(subscriber).await? else {
            return Ok(false);
        };
        let reduced = self
            .quota
            .reduce_usage(&subscription, slug, amount)
            .await
            .map(|record| record.is_some());
        deleted_meanwhile(reduced, &subscription)
    }

    async fn resolve(
        &self,
        subscriber: Option<&SubscriberRef>,
    ) -> Result<Option<(SubscriberRef, Subscription)>> {
        let subscriber = match subscriber {
            Some(subscriber) => subscriber.subscriber_ref(),
            None => match self.config.resolver.as_ref().and_then(|r| r.current()) {
                Some(subscriber) => subscriber,
                None => return Ok(None),
            },
        };

        let active = self.subscriptions.active_subscription(&subscriber).await?;
        if active.is_none() {
            debug!(subscriber = %subscriber, "No active subscription");
        }
        Ok(active.map(|subscription| (subscriber, subscription)))
    }
}

/// A subscription deleted after it was resolved leaves nothing to record
/// against.
fn deleted_meanwhile(result: Result<bool>, subscription: &Subscription) -> Result<bool> {
    match result {
        Err(SubscriptionError::InvalidState(reason)) => {
            debug!(
                subscription_id = %subscription.subscription_id,
                reason = %reason,
                "Subscription deleted while recording usage"
            );
            Ok(false)
        }
        other => other,
    }
}
