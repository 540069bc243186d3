//! Plan and feature definitions.

use crate::config::FeatureConfig;
use crate::error::{Result, SubscriptionError};
use crate::models::{CreateFeature, CreatePlan, ListPlansFilter, Plan, PlanFeature, PlanModule};
use crate::services::clock::Clock;
use crate::services::events::{EventBus, SubscriptionEvent};
use crate::services::metrics::{record_error, record_subscription_operation};
use crate::services::store::SubscriptionStore;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: FeatureConfig,
}

impl PlanCatalog {
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

    /// Create a plan after checking that its trial, billing and grace
    /// periods can be computed.
    #[instrument(skip(self, input), fields(slug = %input.slug))]
    pub async fn create_plan(&self, input: CreatePlan) -> Result<Plan> {
        let now = self.clock.now();
        let plan = input.into_plan(now);
        plan.trial_window(now)?;
        plan.billing_window(now)?;
        plan.grace_window(now)?;

        let plan = self.store.insert_plan(plan).await?;
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");
        record_subscription_operation("create_plan");
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| SubscriptionError::NotFound(format!("plan {}", plan_id)))
    }

    /// Oldest live plan with the slug.
    pub async fn plan_by_slug(&self, slug: &str) -> Result<Plan> {
        self.store
            .get_plan_by_slug(slug)
            .await?
            .ok_or_else(|| SubscriptionError::NotFound(format!("plan \"{}\"", slug)))
    }

    pub async fn list_plans(&self, filter: ListPlansFilter) -> Result<Vec<Plan>> {
        self.store.list_plans(filter).await
    }

    pub async fn activate_plan(&self, plan_id: Uuid) -> Result<Plan> {
        self.set_active(plan_id, true).await
    }

    pub async fn deactivate_plan(&self, plan_id: Uuid) -> Result<Plan> {
        self.set_active(plan_id, false).await
    }

    /// Soft-delete a plan. Its features, their usage and its modules go with
    /// it and its subscriptions are soft-deleted.
    #[instrument(skip(self))]
    pub async fn delete_plan(&self, plan_id: Uuid) -> Result<Plan> {
        let removal = self
            .store
            .delete_plan(plan_id, self.clock.now())
            .await?
            .ok_or_else(|| SubscriptionError::NotFound(format!("plan {}", plan_id)))?;

        info!(
            plan_id = %plan_id,
            subscriptions = removal.subscriptions.len(),
            "Plan deleted"
        );
        for subscription in removal.subscriptions {
            self.events.publish(SubscriptionEvent::Deleted(subscription));
        }
        record_subscription_operation("delete_plan");
        Ok(removal.plan)
    }

    #[instrument(skip(self, input), fields(plan_id = %input.plan_id, slug = %input.slug))]
    pub async fn add_feature(&self, input: CreateFeature) -> Result<PlanFeature> {
        input
            .validate(self.config.allow_unlimited)
            .inspect_err(|e| record_error(e.kind(), "add_feature"))?;
        let plan = self.get_plan(input.plan_id).await?;

        let feature = self
            .store
            .insert_feature(input.into_feature(self.clock.now()))
            .await
            .inspect_err(|e| record_error(e.kind(), "add_feature"))?;

        info!(
            plan_id = %plan.plan_id,
            feature_id = %feature.feature_id,
            value = feature.value,
            "Feature added"
        );
        Ok(feature)
    }

    pub async fn features(&self, plan_id: Uuid) -> Result<Vec<PlanFeature>> {
        self.store.list_features(plan_id).await
    }

    pub async fn feature(&self, plan_id: Uuid, slug: &str) -> Result<PlanFeature> {
        self.store
            .get_feature(plan_id, slug)
            .await?
            .ok_or_else(|| {
                SubscriptionError::NotFound(format!("feature \"{}\" on plan {}", slug, plan_id))
            })
    }

    /// Remove a feature together with its usage entries.
    #[instrument(skip(self))]
    pub async fn delete_feature(&self, plan_id: Uuid, slug: &str) -> Result<()> {
        let feature = self.feature(plan_id, slug).await?;
        self.store.delete_feature(feature.feature_id).await?;
        info!(feature_id = %feature.feature_id, "Feature deleted");
        Ok(())
    }

    /// Switch a module on for a plan. Adding a module the plan already has
    /// returns the existing entry.
    #[instrument(skip(self))]
    pub async fn add_module(&self, plan_id: Uuid, module: &str) -> Result<PlanModule> {
        if module.trim().is_empty() {
            return Err(SubscriptionError::InvalidState(
                "module name must not be empty".to_string(),
            ));
        }
        let plan = self.get_plan(plan_id).await?;
        let module = self
            .store
            .insert_module(PlanModule::new(plan.plan_id, module, self.clock.now()))
            .await
            .inspect_err(|e| record_error(e.kind(), "add_module"))?;
        info!(plan_id = %plan_id, module = %module.module, "Module enabled");
        Ok(module)
    }

    pub async fn modules(&self, plan_id: Uuid) -> Result<Vec<PlanModule>> {
        self.store.list_modules(plan_id).await
    }

    #[instrument(skip(self))]
    pub async fn remove_module(&self, plan_id: Uuid, module: &str) -> Result<()> {
        if !self.store.delete_module(plan_id, module).await? {
            return Err(SubscriptionError::NotFound(format!(
                "module \"{}\" on plan {}",
                module, plan_id
            )));
        }
        info!(plan_id = %plan_id, module = module, "Module disabled");
        Ok(())
    }

    async fn set_active(&self, plan_id: Uuid, is_active: bool) -> Result<Plan> {
        let plan = self
            .store
            .set_plan_active(plan_id, is_active, self.clock.now())
            .await?
            .ok_or_else(|| SubscriptionError::NotFound(format!("plan {}", plan_id)))?;
        info!(plan_id = %plan_id, is_active = is_active, "Plan availability changed");
        Ok(plan)
    }
}
