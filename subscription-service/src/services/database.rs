//! Postgres store for subscription-service.

use crate::error::{Result, SubscriptionError};
use crate::models::{
    look_ahead, ListPlansFilter, Plan, PlanFeature, PlanModule, Subscription, SubscriptionQuery,
    UsageRecord,
};
use crate::services::metrics::STORE_QUERY_DURATION;
use crate::services::store::{
    PlanRemoval, SavedSubscription, SiblingPolicy, SubscriptionMutation, SubscriptionStore,
    SubscriptionWrite, UsageMutation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

const PLAN_COLUMNS: &str = "plan_id, slug, name, description, price, signup_fee, currency, billing_type, trial_period, trial_interval, invoice_period, invoice_interval, grace_period, grace_interval, is_active, is_visible, sort_order, created_utc, updated_utc, deleted_utc";

const FEATURE_COLUMNS: &str = "feature_id, plan_id, slug, name, description, value, resettable_period, resettable_interval, sort_order, created_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, subscriber_type, subscriber_id, plan_id, name, billing_type, trial_ends_at, starts_at, ends_at, cancels_at, canceled_at, is_active, is_paid, created_utc, updated_utc, deleted_utc";

const MODULE_COLUMNS: &str = "module_id, plan_id, module, created_utc";

const USAGE_COLUMNS: &str =
    "usage_id, subscription_id, feature_id, used, valid_until, created_utc, updated_utc";

/// Bind values for [`SubscriptionQuery`] in the shared filter statement.
#[derive(Debug, Default)]
struct QueryParams {
    subscriber: Option<(String, String)>,
    plan_id: Option<Uuid>,
    only_active: bool,
    trial_from: Option<DateTime<Utc>>,
    trial_to: Option<DateTime<Utc>>,
    period_from: Option<DateTime<Utc>>,
    period_to: Option<DateTime<Utc>>,
}

impl QueryParams {
    fn from_query(query: &SubscriptionQuery, now: DateTime<Utc>) -> Result<Self> {
        let horizon = |days: i64| look_ahead(now, days).ok_or(SubscriptionError::InvalidCount(days));
        let mut params = Self::default();
        match query {
            SubscriptionQuery::OfSubscriber(subscriber) => {
                params.subscriber = Some((subscriber.kind.clone(), subscriber.id.clone()));
            }
            SubscriptionQuery::ByPlan(plan_id) => params.plan_id = Some(*plan_id),
            SubscriptionQuery::Active => params.only_active = true,
            SubscriptionQuery::EndingTrial { days } => {
                params.trial_from = Some(now);
                params.trial_to = Some(horizon(*days)?);
            }
            SubscriptionQuery::EndedTrial => params.trial_to = Some(now),
            SubscriptionQuery::EndingPeriod { days } => {
                params.period_from = Some(now);
                params.period_to = Some(horizon(*days)?);
            }
            SubscriptionQuery::EndedPeriod => params.period_to = Some(now),
        }
        Ok(params)
    }
}

fn lock_key_for_subscriber(subscriber_type: &str, subscriber_id: &str) -> String {
    format!("subscriber:{}:{}", subscriber_type, subscriber_id)
}

fn lock_key_for_usage(subscription_id: Uuid, feature_id: Uuid) -> String {
    format!("usage:{}:{}", subscription_id, feature_id)
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> std::result::Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .idle_timeout(std::time::Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> std::result::Result<(), AppError> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> std::result::Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| SubscriptionError::database("Failed to begin transaction", e))
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| SubscriptionError::database("Failed to commit transaction", e))
    }

    /// Serialise writers on `key` until the transaction ends.
    async fn lock(tx: &mut Transaction<'static, Postgres>, key: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(|e| SubscriptionError::database("Failed to acquire advisory lock", e))?;
        Ok(())
    }

    /// Sibling handling, usage clearing and the row upsert. The caller holds
    /// the subscriber lock.
    async fn write_subscription(
        tx: &mut Transaction<'static, Postgres>,
        write: SubscriptionWrite,
    ) -> Result<SavedSubscription> {
        let subscription = write.subscription;
        let now = subscription.updated_utc;

        let deactivated = if subscription.active() {
            let statement = match write.siblings {
                SiblingPolicy::Deactivate => format!(
                    r#"
                    UPDATE subscriptions SET is_active = FALSE, updated_utc = $4
                    WHERE subscriber_type = $1 AND subscriber_id = $2 AND subscription_id <> $3
                      AND is_active = TRUE AND deleted_utc IS NULL
                    RETURNING {SUBSCRIPTION_COLUMNS}
                    "#
                ),
                SiblingPolicy::CancelImmediately => format!(
                    r#"
                    UPDATE subscriptions
                    SET is_active = FALSE, canceled_at = $4, ends_at = $4, updated_utc = $4
                    WHERE subscriber_type = $1 AND subscriber_id = $2 AND subscription_id <> $3
                      AND is_active = TRUE AND deleted_utc IS NULL
                    RETURNING {SUBSCRIPTION_COLUMNS}
                    "#
                ),
            };
            let mut rows = sqlx::query_as::<_, Subscription>(&statement)
                .bind(&subscription.subscriber_type)
                .bind(&subscription.subscriber_id)
                .bind(subscription.subscription_id)
                .bind(now)
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| SubscriptionError::database("Failed to deactivate siblings", e))?;
            rows.sort_by_key(|s| (s.created_utc, s.subscription_id));
            rows
        } else {
            Vec::new()
        };

        if write.clear_usage {
            sqlx::query("DELETE FROM usage_records WHERE subscription_id = $1")
                .bind(subscription.subscription_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| SubscriptionError::database("Failed to clear usage", e))?;
        }

        let saved = Self::upsert_subscription(tx, &subscription).await?;
        Ok(SavedSubscription {
            subscription: saved,
            deactivated,
        })
    }

    async fn upsert_subscription(
        tx: &mut Transaction<'static, Postgres>,
        subscription: &Subscription,
    ) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (subscription_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                name = EXCLUDED.name,
                billing_type = EXCLUDED.billing_type,
                trial_ends_at = EXCLUDED.trial_ends_at,
                starts_at = EXCLUDED.starts_at,
                ends_at = EXCLUDED.ends_at,
                cancels_at = EXCLUDED.cancels_at,
                canceled_at = EXCLUDED.canceled_at,
                is_active = EXCLUDED.is_active,
                is_paid = EXCLUDED.is_paid,
                updated_utc = EXCLUDED.updated_utc,
                deleted_utc = EXCLUDED.deleted_utc
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription.subscription_id)
        .bind(&subscription.subscriber_type)
        .bind(&subscription.subscriber_id)
        .bind(subscription.plan_id)
        .bind(&subscription.name)
        .bind(&subscription.billing_type)
        .bind(subscription.trial_ends_at)
        .bind(subscription.starts_at)
        .bind(subscription.ends_at)
        .bind(subscription.cancels_at)
        .bind(subscription.canceled_at)
        .bind(subscription.is_active)
        .bind(subscription.is_paid)
        .bind(subscription.created_utc)
        .bind(subscription.updated_utc)
        .bind(subscription.deleted_utc)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to save subscription", e))
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self, plan), fields(slug = %plan.slug))]
    async fn insert_plan(&self, plan: Plan) -> Result<Plan> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["insert_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            INSERT INTO plans ({PLAN_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            RETURNING {PLAN_COLUMNS}
            "#
        ))
        .bind(plan.plan_id)
        .bind(&plan.slug)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(plan.signup_fee)
        .bind(&plan.currency)
        .bind(&plan.billing_type)
        .bind(plan.trial_period)
        .bind(&plan.trial_interval)
        .bind(plan.invoice_period)
        .bind(&plan.invoice_interval)
        .bind(plan.grace_period)
        .bind(&plan.grace_interval)
        .bind(plan.is_active)
        .bind(plan.is_visible)
        .bind(plan.sort_order)
        .bind(plan.created_utc)
        .bind(plan.updated_utc)
        .bind(plan.deleted_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to create plan", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE plan_id = $1 AND deleted_utc IS NULL"
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to get plan", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn get_plan_by_slug(&self, slug: &str) -> Result<Option<Plan>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["get_plan_by_slug"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            SELECT {PLAN_COLUMNS} FROM plans
            WHERE slug = $1 AND deleted_utc IS NULL
            ORDER BY created_utc, plan_id
            LIMIT 1
            "#
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to get plan by slug", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn list_plans(&self, filter: ListPlansFilter) -> Result<Vec<Plan>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["list_plans"])
            .start_timer();

        let plans = sqlx::query_as::<_, Plan>(&format!(
            r#"
            SELECT {PLAN_COLUMNS}
            FROM plans
            WHERE deleted_utc IS NULL
              AND ($1::bool = FALSE OR is_active = TRUE)
              AND ($2::bool = FALSE OR is_visible = TRUE)
            ORDER BY sort_order, name
            "#
        ))
        .bind(filter.only_active)
        .bind(filter.only_visible)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to list plans", e))?;

        timer.observe_duration();
        Ok(plans)
    }

    #[instrument(skip(self))]
    async fn set_plan_active(
        &self,
        plan_id: Uuid,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["set_plan_active"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            UPDATE plans SET is_active = $2, updated_utc = $3
            WHERE plan_id = $1 AND deleted_utc IS NULL
            RETURNING {PLAN_COLUMNS}
            "#
        ))
        .bind(plan_id)
        .bind(is_active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to update plan", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn delete_plan(&self, plan_id: Uuid, now: DateTime<Utc>) -> Result<Option<PlanRemoval>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["delete_plan"])
            .start_timer();

        let mut tx = self.begin().await?;

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            UPDATE plans SET deleted_utc = $2, updated_utc = $2
            WHERE plan_id = $1 AND deleted_utc IS NULL
            RETURNING {PLAN_COLUMNS}
            "#
        ))
        .bind(plan_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to delete plan", e))?;

        let Some(plan) = plan else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        // Usage and add-on rows reference features and subscriptions with
        // ON DELETE CASCADE.
        sqlx::query("DELETE FROM plan_features WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| SubscriptionError::database("Failed to delete plan features", e))?;

        sqlx::query("DELETE FROM plan_modules WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| SubscriptionError::database("Failed to delete plan modules", e))?;

        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions SET deleted_utc = $2, updated_utc = $2
            WHERE plan_id = $1 AND deleted_utc IS NULL
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(plan_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to delete plan subscriptions", e))?;

        sqlx::query(
            "DELETE FROM usage_records WHERE subscription_id IN (SELECT subscription_id FROM subscriptions WHERE plan_id = $1)",
        )
        .bind(plan_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to delete plan usage", e))?;

        Self::commit(tx).await?;
        timer.observe_duration();

        let mut subscriptions = subscriptions;
        subscriptions.sort_by_key(|s| (s.created_utc, s.subscription_id));
        Ok(Some(PlanRemoval {
            plan,
            subscriptions,
        }))
    }

    #[instrument(skip(self, feature), fields(plan_id = %feature.plan_id, slug = %feature.slug))]
    async fn insert_feature(&self, feature: PlanFeature) -> Result<PlanFeature> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["insert_feature"])
            .start_timer();

        let result = sqlx::query_as::<_, PlanFeature>(&format!(
            r#"
            INSERT INTO plan_features ({FEATURE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {FEATURE_COLUMNS}
            "#
        ))
        .bind(feature.feature_id)
        .bind(feature.plan_id)
        .bind(&feature.slug)
        .bind(&feature.name)
        .bind(&feature.description)
        .bind(feature.value)
        .bind(feature.resettable_period)
        .bind(&feature.resettable_interval)
        .bind(feature.sort_order)
        .bind(feature.created_utc)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();
        match result {
            Ok(inserted) => Ok(inserted),
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Err(SubscriptionError::DuplicateFeatureSlug {
                    plan_id: feature.plan_id,
                    slug: feature.slug,
                })
            }
            Err(e) => Err(SubscriptionError::database("Failed to create feature", e)),
        }
    }

    #[instrument(skip(self))]
    async fn get_feature(&self, plan_id: Uuid, slug: &str) -> Result<Option<PlanFeature>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["get_feature"])
            .start_timer();

        let feature = sqlx::query_as::<_, PlanFeature>(&format!(
            "SELECT {FEATURE_COLUMNS} FROM plan_features WHERE plan_id = $1 AND slug = $2"
        ))
        .bind(plan_id)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to get feature", e))?;

        timer.observe_duration();
        Ok(feature)
    }

    #[instrument(skip(self))]
    async fn list_features(&self, plan_id: Uuid) -> Result<Vec<PlanFeature>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["list_features"])
            .start_timer();

        let features = sqlx::query_as::<_, PlanFeature>(&format!(
            "SELECT {FEATURE_COLUMNS} FROM plan_features WHERE plan_id = $1 ORDER BY sort_order, slug"
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to list features", e))?;

        timer.observe_duration();
        Ok(features)
    }

    #[instrument(skip(self))]
    async fn delete_feature(&self, feature_id: Uuid) -> Result<bool> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["delete_feature"])
            .start_timer();

        let result = sqlx::query("DELETE FROM plan_features WHERE feature_id = $1")
            .bind(feature_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscriptionError::database("Failed to delete feature", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, module), fields(plan_id = %module.plan_id, module = %module.module))]
    async fn insert_module(&self, module: PlanModule) -> Result<PlanModule> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["insert_module"])
            .start_timer();

        // The no-op update makes RETURNING yield the existing row on conflict.
        let module = sqlx::query_as::<_, PlanModule>(&format!(
            r#"
            INSERT INTO plan_modules ({MODULE_COLUMNS})
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (plan_id, module) DO UPDATE SET module = EXCLUDED.module
            RETURNING {MODULE_COLUMNS}
            "#
        ))
        .bind(module.module_id)
        .bind(module.plan_id)
        .bind(&module.module)
        .bind(module.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to add module", e))?;

        timer.observe_duration();
        Ok(module)
    }

    #[instrument(skip(self))]
    async fn list_modules(&self, plan_id: Uuid) -> Result<Vec<PlanModule>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["list_modules"])
            .start_timer();

        let modules = sqlx::query_as::<_, PlanModule>(&format!(
            "SELECT {MODULE_COLUMNS} FROM plan_modules WHERE plan_id = $1 ORDER BY module"
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to list modules", e))?;

        timer.observe_duration();
        Ok(modules)
    }

    #[instrument(skip(self))]
    async fn delete_module(&self, plan_id: Uuid, module: &str) -> Result<bool> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["delete_module"])
            .start_timer();

        let result = sqlx::query("DELETE FROM plan_modules WHERE plan_id = $1 AND module = $2")
            .bind(plan_id)
            .bind(module)
            .execute(&self.pool)
            .await
            .map_err(|e| SubscriptionError::database("Failed to delete module", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to get subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn find_subscriptions(
        &self,
        query: &SubscriptionQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["find_subscriptions"])
            .start_timer();

        let params = QueryParams::from_query(query, now)?;
        let (subscriber_type, subscriber_id) = params.subscriber.unzip();

        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE deleted_utc IS NULL
              AND ($1::text IS NULL OR (subscriber_type = $1 AND subscriber_id = $2))
              AND ($3::uuid IS NULL OR plan_id = $3)
              AND ($4::bool = FALSE OR is_active = TRUE)
              AND ($5::timestamptz IS NULL OR trial_ends_at >= $5)
              AND ($6::timestamptz IS NULL OR trial_ends_at <= $6)
              AND ($7::timestamptz IS NULL OR ends_at >= $7)
              AND ($8::timestamptz IS NULL OR ends_at <= $8)
            ORDER BY created_utc, subscription_id
            "#
        ))
        .bind(subscriber_type)
        .bind(subscriber_id)
        .bind(params.plan_id)
        .bind(params.only_active)
        .bind(params.trial_from)
        .bind(params.trial_to)
        .bind(params.period_from)
        .bind(params.period_to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to find subscriptions", e))?;

        timer.observe_duration();
        Ok(subscriptions)
    }

    #[instrument(
        skip(self, write),
        fields(subscription_id = %write.subscription.subscription_id)
    )]
    async fn insert_subscription(&self, write: SubscriptionWrite) -> Result<SavedSubscription> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["insert_subscription"])
            .start_timer();

        let mut tx = self.begin().await?;
        let key = lock_key_for_subscriber(
            &write.subscription.subscriber_type,
            &write.subscription.subscriber_id,
        );
        Self::lock(&mut tx, &key).await?;

        let saved = Self::write_subscription(&mut tx, write).await?;
        Self::commit(tx).await?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self, mutation))]
    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        mutation: SubscriptionMutation,
    ) -> Result<Option<SavedSubscription>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let mut tx = self.begin().await?;

        // The subscriber never changes, so the lock key can be read before
        // the lock is held. Taking the advisory lock ahead of the row lock
        // keeps the order used by inserts.
        let owner = sqlx::query_as::<_, (String, String)>(
            "SELECT subscriber_type, subscriber_id FROM subscriptions WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to read subscriber", e))?;

        let Some((subscriber_type, subscriber_id)) = owner else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };
        Self::lock(&mut tx, &lock_key_for_subscriber(&subscriber_type, &subscriber_id)).await?;

        let current = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1 FOR UPDATE"
        ))
        .bind(subscription_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to lock subscription", e))?;

        let write = match mutation(current) {
            Ok(write) => write,
            Err(e) => {
                tx.rollback().await.ok();
                timer.observe_duration();
                return Err(e);
            }
        };

        let saved = Self::write_subscription(&mut tx, write).await?;
        Self::commit(tx).await?;

        timer.observe_duration();
        Ok(Some(saved))
    }

    #[instrument(skip(self))]
    async fn get_usage(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
    ) -> Result<Option<UsageRecord>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["get_usage"])
            .start_timer();

        let record = sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE subscription_id = $1 AND feature_id = $2"
        ))
        .bind(subscription_id)
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to get usage", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn list_usage(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["list_usage"])
            .start_timer();

        let records = sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE subscription_id = $1 ORDER BY created_utc"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to list usage", e))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self, mutation))]
    async fn mutate_usage(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        mutation: UsageMutation,
    ) -> Result<Option<UsageRecord>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["mutate_usage"])
            .start_timer();

        let mut tx = self.begin().await?;
        Self::lock(&mut tx, &lock_key_for_usage(subscription_id, feature_id)).await?;

        // Holds off a concurrent delete until this entry is written, so the
        // delete's usage cleanup sees it.
        let live = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM subscriptions WHERE subscription_id = $1 AND deleted_utc IS NULL FOR SHARE",
        )
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to check subscription", e))?;
        if live.is_none() {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Err(SubscriptionError::InvalidState(format!(
                "subscription {} is deleted or missing",
                subscription_id
            )));
        }

        let current = sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE subscription_id = $1 AND feature_id = $2 FOR UPDATE"
        ))
        .bind(subscription_id)
        .bind(feature_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to read usage", e))?;

        let Some(record) = mutation(current)? else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };

        let saved = sqlx::query_as::<_, UsageRecord>(&format!(
            r#"
            INSERT INTO usage_records ({USAGE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subscription_id, feature_id) DO UPDATE SET
                used = EXCLUDED.used,
                valid_until = EXCLUDED.valid_until,
                updated_utc = EXCLUDED.updated_utc
            RETURNING {USAGE_COLUMNS}
            "#
        ))
        .bind(record.usage_id)
        .bind(record.subscription_id)
        .bind(record.feature_id)
        .bind(record.used)
        .bind(record.valid_until)
        .bind(record.created_utc)
        .bind(record.updated_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::database("Failed to write usage", e))?;

        Self::commit(tx).await?;
        timer.observe_duration();
        Ok(Some(saved))
    }

    #[instrument(skip(self))]
    async fn find_expired_usage(&self, now: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["find_expired_usage"])
            .start_timer();

        let records = sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE valid_until <= $1 ORDER BY valid_until"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to find expired usage", e))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn additional_quantity(&self, subscription_id: Uuid, feature_id: Uuid) -> Result<i64> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["additional_quantity"])
            .start_timer();

        let quantity = sqlx::query_scalar::<_, i64>(
            "SELECT quantity FROM feature_addons WHERE subscription_id = $1 AND feature_id = $2",
        )
        .bind(subscription_id)
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to get additional quantity", e))?;

        timer.observe_duration();
        Ok(quantity.unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn set_additional_quantity(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["set_additional_quantity"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO feature_addons (subscription_id, feature_id, quantity, updated_utc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (subscription_id, feature_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(feature_id)
        .bind(quantity)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SubscriptionError::database("Failed to set additional quantity", e))?;

        timer.observe_duration();
        Ok(())
    }
}
