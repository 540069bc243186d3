//! In-process store.

use crate::error::{Result, SubscriptionError};
use crate::models::{
    ListPlansFilter, Plan, PlanFeature, PlanModule, Subscription, SubscriptionQuery, UsageRecord,
};
use crate::services::store::{
    PlanRemoval, SavedSubscription, SiblingPolicy, SubscriptionMutation, SubscriptionStore,
    SubscriptionWrite, UsageMutation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    plans: HashMap<Uuid, Plan>,
    features: HashMap<Uuid, PlanFeature>,
    modules: HashMap<(Uuid, String), PlanModule>,
    subscriptions: HashMap<Uuid, Subscription>,
    usage: HashMap<(Uuid, Uuid), UsageRecord>,
    additional: HashMap<(Uuid, Uuid), i64>,
}

impl Tables {
    fn remove_feature(&mut self, feature_id: Uuid) -> bool {
        self.usage.retain(|(_, f), _| *f != feature_id);
        self.additional.retain(|(_, f), _| *f != feature_id);
        self.features.remove(&feature_id).is_some()
    }

    fn clear_usage(&mut self, subscription_id: Uuid) {
        self.usage.retain(|(s, _), _| *s != subscription_id);
    }

    fn write_subscription(&mut self, write: SubscriptionWrite) -> SavedSubscription {
        let subscription = write.subscription;
        let now = subscription.updated_utc;

        let mut deactivated = Vec::new();
        if subscription.active() {
            let subscriber = subscription.subscriber();
            for sibling in self.subscriptions.values_mut() {
                if sibling.subscription_id == subscription.subscription_id
                    || !sibling.active()
                    || !sibling.belongs_to(&subscriber)
                {
                    continue;
                }
                match write.siblings {
                    SiblingPolicy::Deactivate => {
                        sibling.is_active = false;
                        sibling.updated_utc = now;
                    }
                    SiblingPolicy::CancelImmediately => sibling.cancel(now, true),
                }
                deactivated.push(sibling.clone());
            }
        }

        if write.clear_usage {
            self.clear_usage(subscription.subscription_id);
        }
        self.subscriptions
            .insert(subscription.subscription_id, subscription.clone());

        SavedSubscription {
            subscription,
            deactivated: sorted_by_creation(deactivated),
        }
    }
}

/// Store backed by hash maps behind a single async mutex. Each operation
/// holds the lock for its whole duration, which makes every operation
/// serializable.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut rows: Vec<Subscription>) -> Vec<Subscription> {
    rows.sort_by(|a, b| {
        a.created_utc
            .cmp(&b.created_utc)
            .then(a.subscription_id.cmp(&b.subscription_id))
    });
    rows
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn insert_plan(&self, plan: Plan) -> Result<Plan> {
        let mut tables = self.tables.lock().await;
        tables.plans.insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .plans
            .get(&plan_id)
            .filter(|p| p.deleted_utc.is_none())
            .cloned())
    }

    async fn get_plan_by_slug(&self, slug: &str) -> Result<Option<Plan>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .plans
            .values()
            .filter(|p| p.deleted_utc.is_none() && p.slug == slug)
            .min_by(|a, b| a.created_utc.cmp(&b.created_utc).then(a.plan_id.cmp(&b.plan_id)))
            .cloned())
    }

    async fn list_plans(&self, filter: ListPlansFilter) -> Result<Vec<Plan>> {
        let tables = self.tables.lock().await;
        let mut plans: Vec<Plan> = tables
            .plans
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.name.cmp(&b.name)));
        Ok(plans)
    }

    async fn set_plan_active(
        &self,
        plan_id: Uuid,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .plans
            .get_mut(&plan_id)
            .filter(|p| p.deleted_utc.is_none())
            .map(|plan| {
                plan.is_active = is_active;
                plan.updated_utc = now;
                plan.clone()
            }))
    }

    async fn delete_plan(&self, plan_id: Uuid, now: DateTime<Utc>) -> Result<Option<PlanRemoval>> {
        let mut tables = self.tables.lock().await;
        let plan = match tables.plans.get_mut(&plan_id) {
            Some(plan) if plan.deleted_utc.is_none() => {
                plan.deleted_utc = Some(now);
                plan.updated_utc = now;
                plan.clone()
            }
            _ => return Ok(None),
        };

        let feature_ids: Vec<Uuid> = tables
            .features
            .values()
            .filter(|f| f.plan_id == plan_id)
            .map(|f| f.feature_id)
            .collect();
        for feature_id in feature_ids {
            tables.remove_feature(feature_id);
        }
        tables.modules.retain(|(p, _), _| *p != plan_id);

        let mut subscriptions = Vec::new();
        for subscription in tables.subscriptions.values_mut() {
            if subscription.plan_id == plan_id && !subscription.is_deleted() {
                subscription.deleted_utc = Some(now);
                subscription.updated_utc = now;
                subscriptions.push(subscription.clone());
            }
        }
        for subscription in &subscriptions {
            tables.clear_usage(subscription.subscription_id);
        }

        Ok(Some(PlanRemoval {
            plan,
            subscriptions: sorted_by_creation(subscriptions),
        }))
    }

    async fn insert_feature(&self, feature: PlanFeature) -> Result<PlanFeature> {
        let mut tables = self.tables.lock().await;
        let duplicate = tables
            .features
            .values()
            .any(|f| f.plan_id == feature.plan_id && f.slug == feature.slug);
        if duplicate {
            return Err(SubscriptionError::DuplicateFeatureSlug {
                plan_id: feature.plan_id,
                slug: feature.slug,
            });
        }
        tables.features.insert(feature.feature_id, feature.clone());
        Ok(feature)
    }

    async fn get_feature(&self, plan_id: Uuid, slug: &str) -> Result<Option<PlanFeature>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .features
            .values()
            .find(|f| f.plan_id == plan_id && f.slug == slug)
            .cloned())
    }

    async fn list_features(&self, plan_id: Uuid) -> Result<Vec<PlanFeature>> {
        let tables = self.tables.lock().await;
        let mut features: Vec<PlanFeature> = tables
            .features
            .values()
            .filter(|f| f.plan_id == plan_id)
            .cloned()
            .collect();
        features.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.slug.cmp(&b.slug)));
        Ok(features)
    }

    async fn delete_feature(&self, feature_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.remove_feature(feature_id))
    }

    async fn insert_module(&self, module: PlanModule) -> Result<PlanModule> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .modules
            .entry((module.plan_id, module.module.clone()))
            .or_insert(module)
            .clone())
    }

    async fn list_modules(&self, plan_id: Uuid) -> Result<Vec<PlanModule>> {
        let tables = self.tables.lock().await;
        let mut modules: Vec<PlanModule> = tables
            .modules
            .values()
            .filter(|m| m.plan_id == plan_id)
            .cloned()
            .collect();
        modules.sort_by(|a, b| a.module.cmp(&b.module));
        Ok(modules)
    }

    async fn delete_module(&self, plan_id: Uuid, module: &str) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .modules
            .remove(&(plan_id, module.to_string()))
            .is_some())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(tables.subscriptions.get(&subscription_id).cloned())
    }

    async fn find_subscriptions(
        &self,
        query: &SubscriptionQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let tables = self.tables.lock().await;
        let rows = tables
            .subscriptions
            .values()
            .filter(|s| query.matches(s, now))
            .cloned()
            .collect();
        Ok(sorted_by_creation(rows))
    }

    async fn insert_subscription(&self, write: SubscriptionWrite) -> Result<SavedSubscription> {
        let mut tables = self.tables.lock().await;
        Ok(tables.write_subscription(write))
    }

    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        mutation: SubscriptionMutation,
    ) -> Result<Option<SavedSubscription>> {
        let mut tables = self.tables.lock().await;
        let Some(current) = tables.subscriptions.get(&subscription_id).cloned() else {
            return Ok(None);
        };
        let write = mutation(current)?;
        Ok(Some(tables.write_subscription(write)))
    }

    async fn get_usage(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
    ) -> Result<Option<UsageRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.usage.get(&(subscription_id, feature_id)).cloned())
    }

    async fn list_usage(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>> {
        let tables = self.tables.lock().await;
        let mut records: Vec<UsageRecord> = tables
            .usage
            .values()
            .filter(|u| u.subscription_id == subscription_id)
            .cloned()
            .collect();
        records.sort_by_key(|u| u.created_utc);
        Ok(records)
    }

    async fn mutate_usage(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        mutation: UsageMutation,
    ) -> Result<Option<UsageRecord>> {
        let mut tables = self.tables.lock().await;
        if !tables
            .subscriptions
            .get(&subscription_id)
            .is_some_and(|s| !s.is_deleted())
        {
            return Err(SubscriptionError::InvalidState(format!(
                "subscription {} is deleted or missing",
                subscription_id
            )));
        }
        let key = (subscription_id, feature_id);
        let current = tables.usage.get(&key).cloned();
        let updated = mutation(current)?;
        if let Some(record) = &updated {
            tables.usage.insert(key, record.clone());
        }
        Ok(updated)
    }

    async fn find_expired_usage(&self, now: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .usage
            .values()
            .filter(|u| u.is_expired(now))
            .cloned()
            .collect())
    }

    async fn additional_quantity(&self, subscription_id: Uuid, feature_id: Uuid) -> Result<i64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .additional
            .get(&(subscription_id, feature_id))
            .copied()
            .unwrap_or(0))
    }

    async fn set_additional_quantity(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        quantity: i64,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .additional
            .insert((subscription_id, feature_id), quantity);
        Ok(())
    }
}
