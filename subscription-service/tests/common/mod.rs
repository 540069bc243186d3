//! Test helper module for subscription-service integration tests.
//!
//! Provides an in-memory application with a manually driven clock, plus the
//! PostgreSQL setup used by the store tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use subscription_service::config::FeatureConfig;
use subscription_service::models::{
    CreateFeature, CreatePlan, Interval, NewSubscription, Plan, PlanFeature, SubscriberRef,
    Subscription, UsageRecord,
};
use subscription_service::services::{
    init_metrics, Database, FeatureManagerConfig, InMemoryStore, ManualClock, SubscriptionEvent,
    SubscriptionStore,
};
use subscription_service::startup::AppState;
use tokio::sync::broadcast;
use uuid::Uuid;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// 2025-01-01T00:00:00Z, the instant every test app starts at.
pub fn start_time() -> DateTime<Utc> {
    at(2025, 1, 1)
}

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn user(id: &str) -> SubscriberRef {
    SubscriberRef::new("user", id)
}

/// Test application wrapper for in-memory integration tests.
pub struct TestApp {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(FeatureConfig::default(), FeatureManagerConfig::new())
    }

    pub fn spawn_with(features: FeatureConfig, manager: FeatureManagerConfig) -> Self {
        init_metrics();

        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(InMemoryStore::new());
        let state = AppState::new(store.clone(), clock.clone(), features, manager);

        TestApp {
            state,
            clock,
            store,
        }
    }

    pub fn set_time(&self, now: DateTime<Utc>) {
        self.clock.set(now);
    }

    pub fn advance_days(&self, days: i64) {
        self.clock.advance(Duration::days(days));
    }

    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.state.events.subscribe()
    }

    /// A visible monthly plan without trial.
    pub async fn monthly_plan(&self, slug: &str) -> Plan {
        self.create_plan(CreatePlan::monthly(slug, slug, Decimal::new(1900, 2)))
            .await
    }

    pub async fn plan_with_trial(&self, slug: &str, trial_days: i32) -> Plan {
        let mut input = CreatePlan::monthly(slug, slug, Decimal::new(1900, 2));
        input.trial_period = trial_days;
        input.trial_interval = Interval::Day;
        self.create_plan(input).await
    }

    pub async fn yearly_plan(&self, slug: &str) -> Plan {
        let mut input = CreatePlan::monthly(slug, slug, Decimal::new(19000, 2));
        input.invoice_interval = Interval::Year;
        self.create_plan(input).await
    }

    pub async fn create_plan(&self, input: CreatePlan) -> Plan {
        self.state
            .catalog
            .create_plan(input)
            .await
            .expect("Failed to create plan")
    }

    /// Feature whose usage resets every month.
    pub async fn monthly_feature(&self, plan: &Plan, slug: &str, value: i64) -> PlanFeature {
        self.add_feature(
            CreateFeature::new(plan.plan_id, slug, value).resetting_every(1, Interval::Month),
        )
        .await
    }

    /// Feature whose usage never resets.
    pub async fn lifetime_feature(&self, plan: &Plan, slug: &str, value: i64) -> PlanFeature {
        self.add_feature(CreateFeature::new(plan.plan_id, slug, value))
            .await
    }

    pub async fn add_feature(&self, input: CreateFeature) -> PlanFeature {
        self.state
            .catalog
            .add_feature(input)
            .await
            .expect("Failed to add feature")
    }

    pub async fn subscribe(&self, subscriber: &SubscriberRef, plan: &Plan) -> Subscription {
        self.state
            .subscriptions
            .create(NewSubscription::new(subscriber.clone(), "main"), plan.plan_id)
            .await
            .expect("Failed to create subscription")
    }

    /// Row as stored, including soft-deleted rows.
    pub async fn stored(&self, subscription_id: Uuid) -> Subscription {
        self.store
            .get_subscription(subscription_id)
            .await
            .expect("Failed to read subscription")
            .expect("Subscription missing")
    }

    pub async fn usage_entry(&self, subscription_id: Uuid, feature_id: Uuid) -> Option<UsageRecord> {
        self.store
            .get_usage(subscription_id, feature_id)
            .await
            .expect("Failed to read usage")
    }

    /// Number of active, non-deleted subscriptions the subscriber holds.
    pub async fn active_count(&self, subscriber: &SubscriberRef) -> usize {
        self.state
            .subscriptions
            .active_subscriptions(subscriber)
            .await
            .expect("Failed to list subscriptions")
            .len()
    }
}

/// Drain every event currently buffered on the receiver.
pub fn drain(receiver: &mut broadcast::Receiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

/// Get the database URL for testing from environment, if configured.
pub fn get_test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

/// Generate a unique schema name for test isolation.
fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_subscription_{}_{}", std::process::id(), counter)
}

/// PostgreSQL store in its own schema.
pub struct TestDatabase {
    pub db: Arc<Database>,
    base_url: String,
    schema_name: String,
}

impl TestDatabase {
    /// Returns `None` when `TEST_DATABASE_URL` is not set.
    pub async fn spawn() -> Option<Self> {
        let base_url = get_test_database_url()?;
        let schema_name = unique_schema_name();

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");

        pool.close().await;

        // Use ? or & depending on whether URL already has query parameters
        let separator = if base_url.contains('?') { "&" } else { "?" };
        let db_url_with_schema = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let db = Database::new(&db_url_with_schema, 5, 1)
            .await
            .expect("Failed to create test database");
        db.run_migrations()
            .await
            .expect("Failed to run migrations");

        Some(TestDatabase {
            db: Arc::new(db),
            base_url,
            schema_name,
        })
    }

    /// App state backed by this database and a manual clock.
    pub fn app(&self) -> (AppState, Arc<ManualClock>) {
        init_metrics();
        let clock = Arc::new(ManualClock::new(start_time()));
        let state = AppState::new(
            self.db.clone(),
            clock.clone(),
            FeatureConfig::default(),
            FeatureManagerConfig::new(),
        );
        (state, clock)
    }

    /// Cleanup test resources (schema).
    pub async fn cleanup(&self) {
        self.db.pool().close().await;

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await
            .ok();

        if let Some(pool) = pool {
            let _ = sqlx::query(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                self.schema_name
            ))
            .execute(&pool)
            .await;
            pool.close().await;
        }
    }
}
