//! Plan feature model.

use crate::error::{Result, SubscriptionError};
use crate::models::period::{Interval, Period};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored feature value meaning "no ceiling".
pub const UNLIMITED: i64 = -1;

/// Quota granted by a feature value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "limit")]
pub enum Quota {
    Unlimited,
    Disabled,
    Limited(i64),
}

impl Quota {
    pub fn from_value(value: i64) -> Self {
        match value {
            UNLIMITED => Quota::Unlimited,
            v if v <= 0 => Quota::Disabled,
            v => Quota::Limited(v),
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Quota::Unlimited => UNLIMITED,
            Quota::Disabled => 0,
            Quota::Limited(v) => *v,
        }
    }
}

/// Metered capability granted by a plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanFeature {
    pub feature_id: Uuid,
    pub plan_id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub value: i64,
    pub resettable_period: i32,
    pub resettable_interval: String,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

impl PlanFeature {
    pub fn quota(&self) -> Quota {
        Quota::from_value(self.value)
    }

    /// A zero reset period means usage accumulates for the whole subscription.
    pub fn is_resettable(&self) -> bool {
        self.resettable_period > 0
    }

    /// End of the reset cycle that starts at `from`.
    pub fn reset_date(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(Period::parse(&self.resettable_interval, self.resettable_period, from)?.end())
    }
}

/// Input for creating a plan feature.
#[derive(Debug, Clone)]
pub struct CreateFeature {
    pub plan_id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub value: i64,
    pub resettable_period: i32,
    pub resettable_interval: Interval,
    pub sort_order: i32,
}

impl CreateFeature {
    /// A feature whose usage never resets.
    pub fn new(plan_id: Uuid, slug: &str, value: i64) -> Self {
        Self {
            plan_id,
            slug: slug.to_string(),
            name: slug.to_string(),
            description: None,
            value,
            resettable_period: 0,
            resettable_interval: Interval::Month,
            sort_order: 0,
        }
    }

    pub fn resetting_every(mut self, count: i32, interval: Interval) -> Self {
        self.resettable_period = count;
        self.resettable_interval = interval;
        self
    }

    pub fn validate(&self, allow_unlimited: bool) -> Result<()> {
        if self.value < UNLIMITED || (self.value == UNLIMITED && !allow_unlimited) {
            return Err(SubscriptionError::InvalidFeatureValue(self.value));
        }
        if self.resettable_period < 0 {
            return Err(SubscriptionError::InvalidCount(self.resettable_period.into()));
        }
        Ok(())
    }

    pub(crate) fn into_feature(self, now: DateTime<Utc>) -> PlanFeature {
        PlanFeature {
            feature_id: Uuid::new_v4(),
            plan_id: self.plan_id,
            slug: self.slug,
            name: self.name,
            description: self.description,
            value: self.value,
            resettable_period: self.resettable_period,
            resettable_interval: self.resettable_interval.as_str().to_string(),
            sort_order: self.sort_order,
            created_utc: now,
        }
    }
}
