//! Usage ledger model.

use crate::models::feature::Quota;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Consumed quantity of one feature by one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub usage_id: Uuid,
    pub subscription_id: Uuid,
    pub feature_id: Uuid,
    pub used: i64,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(subscription_id: Uuid, feature_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            usage_id: Uuid::new_v4(),
            subscription_id,
            feature_id,
            used: 0,
            valid_until: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| now >= until)
    }

    /// Usage that still counts against the quota at `now`.
    pub fn current_usage(&self, now: DateTime<Utc>) -> i64 {
        if self.is_expired(now) {
            0
        } else {
            self.used
        }
    }
}

/// Point-in-time quota view of one feature for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub feature_slug: String,
    pub quota: Quota,
    /// Purchased add-on quantity on top of the plan value.
    pub additional: i64,
    pub used: i64,
    /// Raw remaining allowance; negative when usage overshot the quota.
    pub remaining: i64,
    pub valid_until: Option<DateTime<Utc>>,
    pub can_use: bool,
}

impl QuotaStatus {
    /// Remaining allowance for display, never below zero.
    pub fn display_remaining(&self) -> i64 {
        self.remaining.max(0)
    }
}
