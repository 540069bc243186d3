//! Configuration module for subscription-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub features: FeatureConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Quota policy shared by the quota engine and the feature usage facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureConfig {
    /// Whether `-1` (unlimited) may be stored as a feature value.
    pub allow_unlimited: bool,
    /// Whether purchased add-on quantity counts toward `remaining()`.
    pub include_purchased: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            allow_unlimited: true,
            include_purchased: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    pub ending_within_days: i64,
    pub dry_run: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            ending_within_days: 3,
            dry_run: false,
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl FeatureConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allow_unlimited: parse_or("FEATURES_ALLOW_UNLIMITED", defaults.allow_unlimited),
            include_purchased: parse_or("FEATURES_INCLUDE_PURCHASED", defaults.include_purchased),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let config = Self {
            interval: Duration::from_secs(parse_or(
                "SWEEP_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
            ending_within_days: parse_or("SWEEP_ENDING_WITHIN_DAYS", defaults.ending_within_days),
            dry_run: parse_or("SWEEP_DRY_RUN", defaults.dry_run),
        };
        config.validate()?;
        Ok(config)
    }

    /// The interval drives a ticker and must be positive.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.interval.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SWEEP_INTERVAL_SECS must be greater than zero"
            )));
        }
        Ok(())
    }
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| common.service_name.clone()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| common.log_level.clone()),
            otlp_endpoint: env::var("OTLP_ENDPOINT")
                .ok()
                .or_else(|| common.otlp_endpoint.clone()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            features: FeatureConfig::from_env(),
            sweep: SweepConfig::from_env()?,
            common,
        })
    }
}
