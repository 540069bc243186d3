//! Application startup and lifecycle management.

use crate::config::{FeatureConfig, SubscriptionConfig, SweepConfig};
use crate::error::Result;
use crate::models::SubscriptionQuery;
use crate::services::{
    init_metrics, Clock, Database, EventBus, FeatureManagerConfig, FeatureUsageManager,
    PlanCatalog, QuotaEngine, SubscriptionService, SubscriptionStore, SystemClock,
};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared services wired to one store, clock and event bus.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SubscriptionStore>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub catalog: PlanCatalog,
    pub subscriptions: SubscriptionService,
    pub quota: QuotaEngine,
    pub features: FeatureUsageManager,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        features: FeatureConfig,
        manager: FeatureManagerConfig,
    ) -> Self {
        let events = EventBus::new();
        let catalog = PlanCatalog::new(store.clone(), clock.clone(), events.clone(), features);
        let subscriptions = SubscriptionService::new(store.clone(), clock.clone(), events.clone());
        let quota = QuotaEngine::new(store.clone(), clock.clone(), events.clone(), features);
        let feature_manager =
            FeatureUsageManager::new(subscriptions.clone(), quota.clone(), manager);

        Self {
            store,
            clock,
            events,
            catalog,
            subscriptions,
            quota,
            features: feature_manager,
        }
    }

    /// One maintenance pass: reset expired usage and report subscriptions
    /// whose trial or billing period is ending or has ended.
    pub async fn sweep(&self, config: &SweepConfig) -> Result<SweepReport> {
        let expired_usage = self.quota.reset_expired_usage(config.dry_run).await?;

        let days = config.ending_within_days;
        let ending_trials = self
            .subscriptions
            .find(SubscriptionQuery::EndingTrial { days })
            .await?;
        let ending_periods = self
            .subscriptions
            .find(SubscriptionQuery::EndingPeriod { days })
            .await?;
        let ended_periods = self
            .subscriptions
            .find(SubscriptionQuery::EndedPeriod)
            .await?;

        for subscription in &ended_periods {
            if subscription.is_active {
                info!(
                    subscription_id = %subscription.subscription_id,
                    subscriber = %subscription.subscriber(),
                    ends_at = ?subscription.ends_at,
                    "Active subscription past its billing period"
                );
            }
        }

        let report = SweepReport {
            expired_usage,
            ending_trials: ending_trials.len(),
            ending_periods: ending_periods.len(),
            ended_periods: ended_periods.len(),
        };
        info!(
            expired_usage = report.expired_usage,
            ending_trials = report.ending_trials,
            ending_periods = report.ending_periods,
            ended_periods = report.ended_periods,
            dry_run = config.dry_run,
            "Sweep completed"
        );
        Ok(report)
    }
}

/// Counts from one [`AppState::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_usage: usize,
    pub ending_trials: usize,
    pub ending_periods: usize,
    pub ended_periods: usize,
}

/// Application container for the maintenance sweeper.
pub struct Application {
    config: SubscriptionConfig,
    db: Arc<Database>,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SubscriptionConfig) -> std::result::Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(
        config: SubscriptionConfig,
    ) -> std::result::Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: SubscriptionConfig,
        run_migrations: bool,
    ) -> std::result::Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let state = AppState::new(
            db.clone(),
            Arc::new(SystemClock),
            config.features,
            FeatureManagerConfig::new(),
        );

        Ok(Self { config, db, state })
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Sweep on every tick of the configured interval until the future is
    /// dropped. A failed pass is logged and retried on the next tick.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.db.health_check().await.map_err(|e| {
            tracing::error!(error = %e, "Database unavailable");
            std::io::Error::other(format!("Database unavailable: {}", e))
        })?;

        let sweep = self.config.sweep;
        sweep
            .validate()
            .map_err(|e| std::io::Error::other(format!("Invalid sweep configuration: {}", e)))?;
        info!(
            service = %self.config.service_name,
            version = env!("CARGO_PKG_VERSION"),
            interval_secs = sweep.interval.as_secs(),
            ending_within_days = sweep.ending_within_days,
            dry_run = sweep.dry_run,
            "Sweeper ready"
        );

        let mut ticker = tokio::time::interval(sweep.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.state.sweep(&sweep).await {
                warn!(error = %e, kind = e.kind(), "Sweep failed");
            }
        }
    }
}
