//! Feature quota engine: usage ledger arithmetic and quota decisions.

use crate::config::FeatureConfig;
use crate::error::{Result, SubscriptionError};
use crate::models::{PlanFeature, Quota, QuotaStatus, Subscription, UsageRecord};
use crate::services::clock::Clock;
use crate::services::events::{EventBus, SubscriptionEvent};
use crate::services::metrics::{record_error, record_quota_decision, record_usage_operation};
use crate::services::store::SubscriptionStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Apply a usage record to the current ledger entry.
///
/// A resettable feature anchors its first reset at the subscription's
/// creation instant. An expired entry advances one reset cycle from its
/// previous boundary and starts again from zero. No upper clamp is applied.
pub fn apply_usage(
    current: Option<UsageRecord>,
    feature: &PlanFeature,
    subscription: &Subscription,
    amount: i64,
    incremental: bool,
    now: DateTime<Utc>,
) -> Result<UsageRecord> {
    let mut record = current.unwrap_or_else(|| {
        UsageRecord::new(subscription.subscription_id, feature.feature_id, now)
    });

    if feature.is_resettable() {
        match record.valid_until {
            None => record.valid_until = Some(feature.reset_date(subscription.created_utc)?),
            Some(until) if now >= until => {
                record.valid_until = Some(feature.reset_date(until)?);
                record.used = 0;
            }
            Some(_) => {}
        }
    }

    let used = if incremental {
        record.used.saturating_add(amount)
    } else {
        amount
    };
    record.used = used.max(0);
    record.updated_utc = now;
    Ok(record)
}

/// Lower the usage of an existing entry, never below zero.
pub fn reduce_usage(
    current: Option<UsageRecord>,
    amount: i64,
    now: DateTime<Utc>,
) -> Option<UsageRecord> {
    current.map(|mut record| {
        record.used = record.used.saturating_sub(amount).max(0);
        record.updated_utc = now;
        record
    })
}

/// Plan quota with the purchased quantity added to the ceiling.
/// Unlimited stays unlimited.
pub fn effective_quota(feature: &PlanFeature, additional: i64) -> Quota {
    match feature.quota() {
        Quota::Unlimited => Quota::Unlimited,
        quota => Quota::from_value(quota.value().saturating_add(additional.max(0))),
    }
}

/// Raw remaining allowance; `i64::MAX` for an unlimited quota.
pub fn remaining(quota: Quota, used: i64) -> i64 {
    match quota {
        Quota::Unlimited => i64::MAX,
        quota => quota.value() - used,
    }
}

pub fn can_use(quota: Quota, used: i64) -> bool {
    match quota {
        Quota::Unlimited => true,
        Quota::Disabled => false,
        Quota::Limited(_) => remaining(quota, used) > 0,
    }
}

/// Record, reduce and check feature usage for a subscription.
#[derive(Clone)]
pub struct QuotaEngine {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: FeatureConfig,
}

impl QuotaEngine {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: FeatureConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Feature of the subscription's plan, or `NotFound`.
    pub async fn feature(&self, subscription: &Subscription, slug: &str) -> Result<PlanFeature> {
        self.store
            .get_feature(subscription.plan_id, slug)
            .await?
            .ok_or_else(|| {
                record_error("not_found", "feature_lookup");
                SubscriptionError::NotFound(format!(
                    "feature \"{}\" on plan {}",
                    slug, subscription.plan_id
                ))
            })
    }

    /// Fails with `InvalidState` when the subscription has been deleted,
    /// however recent the caller's copy of it.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    pub async fn record_usage(
        &self,
        subscription: &Subscription,
        slug: &str,
        amount: i64,
        incremental: bool,
    ) -> Result<UsageRecord> {
        let feature = self.feature(subscription, slug).await?;
        let now = self.clock.now();

        let owner = subscription.clone();
        let definition = feature.clone();
        let record = self
            .store
            .mutate_usage(
                subscription.subscription_id,
                feature.feature_id,
                Box::new(move |current| {
                    apply_usage(current, &definition, &owner, amount, incremental, now).map(Some)
                }),
            )
            .await
            .inspect_err(|e| record_error(e.kind(), "record_usage"))?
            .ok_or_else(|| {
                SubscriptionError::InvalidState(format!("usage for \"{}\" was not written", slug))
            })?;

        record_usage_operation(slug, "record");
        debug!(
            feature = slug,
            used = record.used,
            valid_until = ?record.valid_until,
            "Usage recorded"
        );
        Ok(record)
    }

    /// Returns `None` when the subscription has no usage for the feature yet.
    /// A deleted subscription fails with `InvalidState`.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    pub async fn reduce_usage(
        &self,
        subscription: &Subscription,
        slug: &str,
        amount: i64,
    ) -> Result<Option<UsageRecord>> {
        let feature = self.feature(subscription, slug).await?;
        let now = self.clock.now();

        let record = self
            .store
            .mutate_usage(
                subscription.subscription_id,
                feature.feature_id,
                Box::new(move |current| Ok(reduce_usage(current, amount, now))),
            )
            .await
            .inspect_err(|e| record_error(e.kind(), "reduce_usage"))?;

        if let Some(record) = &record {
            record_usage_operation(slug, "reduce");
            debug!(feature = slug, used = record.used, "Usage reduced");
        }
        Ok(record)
    }

    /// Usage counting against the quota right now; zero when there is no
    /// entry or the entry has expired.
    pub async fn usage(&self, subscription: &Subscription, slug: &str) -> Result<i64> {
        Ok(self.quota_status(subscription, slug).await?.used)
    }

    pub async fn remaining(&self, subscription: &Subscription, slug: &str) -> Result<i64> {
        Ok(self.quota_status(subscription, slug).await?.remaining)
    }

    pub async fn can_use(&self, subscription: &Subscription, slug: &str) -> Result<bool> {
        let status = self.quota_status(subscription, slug).await?;
        record_quota_decision(slug, status.can_use);
        Ok(status.can_use)
    }

    pub async fn quota_status(
        &self,
        subscription: &Subscription,
        slug: &str,
    ) -> Result<QuotaStatus> {
        let feature = self.feature(subscription, slug).await?;
        self.status_of(subscription, &feature).await
    }

    /// Quota status of every feature on the subscription's plan.
    pub async fn feature_summary(&self, subscription: &Subscription) -> Result<Vec<QuotaStatus>> {
        let features = self.store.list_features(subscription.plan_id).await?;
        let mut summary = Vec::with_capacity(features.len());
        for feature in &features {
            summary.push(self.status_of(subscription, feature).await?);
        }
        Ok(summary)
    }

    /// Plan value plus purchased quantity; `-1` for unlimited features.
    pub async fn total_feature_balance(
        &self,
        subscription: &Subscription,
        slug: &str,
    ) -> Result<i64> {
        let feature = self.feature(subscription, slug).await?;
        let additional = self
            .store
            .additional_quantity(subscription.subscription_id, feature.feature_id)
            .await?;
        Ok(effective_quota(&feature, additional).value())
    }

    pub async fn additional_quantity(
        &self,
        subscription: &Subscription,
        slug: &str,
    ) -> Result<i64> {
        let feature = self.feature(subscription, slug).await?;
        self.store
            .additional_quantity(subscription.subscription_id, feature.feature_id)
            .await
    }

    /// Replace the purchased add-on quantity for a feature.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    pub async fn set_additional_quantity(
        &self,
        subscription: &Subscription,
        slug: &str,
        quantity: i64,
    ) -> Result<()> {
        if quantity < 0 {
            return Err(SubscriptionError::InvalidCount(quantity));
        }
        let feature = self.feature(subscription, slug).await?;
        self.store
            .set_additional_quantity(
                subscription.subscription_id,
                feature.feature_id,
                quantity,
                self.clock.now(),
            )
            .await?;
        record_usage_operation(slug, "set_additional");
        info!(feature = slug, quantity = quantity, "Additional quantity updated");
        Ok(())
    }

    /// Zero every expired usage entry and clear its reset boundary so the
    /// next record re-anchors it. Returns the number of entries found.
    #[instrument(skip(self))]
    pub async fn reset_expired_usage(&self, dry_run: bool) -> Result<usize> {
        let now = self.clock.now();
        let expired = self.store.find_expired_usage(now).await?;

        if dry_run {
            info!(count = expired.len(), "Dry run: expired usage entries left untouched");
            return Ok(expired.len());
        }

        let mut reset = 0;
        for entry in &expired {
            let result = self
                .store
                .mutate_usage(
                    entry.subscription_id,
                    entry.feature_id,
                    Box::new(move |current| {
                        Ok(current.filter(|u| u.is_expired(now)).map(|mut u| {
                            u.used = 0;
                            u.valid_until = None;
                            u.updated_utc = now;
                            u
                        }))
                    }),
                )
                .await;

            match result {
                Ok(Some(_)) => {
                    reset += 1;
                    self.events.publish(SubscriptionEvent::UsageReset {
                        subscription_id: entry.subscription_id,
                        feature_id: entry.feature_id,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    record_error(e.kind(), "reset_expired_usage");
                    warn!(
                        error = %e,
                        subscription_id = %entry.subscription_id,
                        feature_id = %entry.feature_id,
                        "Failed to reset usage entry"
                    );
                }
            }
        }

        info!(found = expired.len(), reset = reset, "Expired usage reset");
        Ok(expired.len())
    }

    async fn status_of(
        &self,
        subscription: &Subscription,
        feature: &PlanFeature,
    ) -> Result<QuotaStatus> {
        let now = self.clock.now();
        let entry = self
            .store
            .get_usage(subscription.subscription_id, feature.feature_id)
            .await?;
        let additional = if self.config.include_purchased {
            self.store
                .additional_quantity(subscription.subscription_id, feature.feature_id)
                .await?
        } else {
            0
        };

        let quota = effective_quota(feature, additional);
        let used = entry.as_ref().map_or(0, |e| e.current_usage(now));
        let valid_until = entry
            .as_ref()
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.valid_until);

        Ok(QuotaStatus {
            feature_slug: feature.slug.clone(),
            quota: feature.quota(),
            additional,
            used,
            remaining: remaining(quota, used),
            valid_until,
            can_use: can_use(quota, used),
        })
    }
}
