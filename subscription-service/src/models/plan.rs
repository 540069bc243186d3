//! Plan model.

use crate::error::Result;
use crate::models::period::{Interval, Period};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How a plan is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    Payg,
    Fixed,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::Payg => "payg",
            BillingType::Fixed => "fixed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "payg" => BillingType::Payg,
            _ => BillingType::Fixed,
        }
    }
}

/// Subscription plan.
///
/// Interval columns hold the string form of [`Interval`]; use the
/// `*_window` helpers to turn them into concrete periods.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub signup_fee: Decimal,
    pub currency: String,
    pub billing_type: String,
    pub trial_period: i32,
    pub trial_interval: String,
    pub invoice_period: i32,
    pub invoice_interval: String,
    pub grace_period: i32,
    pub grace_interval: String,
    pub is_active: bool,
    pub is_visible: bool,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price <= Decimal::ZERO
    }

    pub fn has_trial(&self) -> bool {
        self.trial_period > 0
    }

    pub fn has_grace(&self) -> bool {
        self.grace_period > 0
    }

    pub fn billing_type(&self) -> BillingType {
        BillingType::from_string(&self.billing_type)
    }

    pub fn trial_window(&self, start: DateTime<Utc>) -> Result<Period> {
        Period::parse(&self.trial_interval, self.trial_period, start)
    }

    pub fn billing_window(&self, start: DateTime<Utc>) -> Result<Period> {
        Period::parse(&self.invoice_interval, self.invoice_period, start)
    }

    pub fn grace_window(&self, start: DateTime<Utc>) -> Result<Period> {
        Period::parse(&self.grace_interval, self.grace_period, start)
    }

    /// Whether both plans bill on the same interval and count.
    pub fn same_billing_cadence(&self, other: &Plan) -> bool {
        self.invoice_interval == other.invoice_interval
            && self.invoice_period == other.invoice_period
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub signup_fee: Decimal,
    pub currency: String,
    pub billing_type: BillingType,
    pub trial_period: i32,
    pub trial_interval: Interval,
    pub invoice_period: i32,
    pub invoice_interval: Interval,
    pub grace_period: i32,
    pub grace_interval: Interval,
    pub is_visible: bool,
    pub sort_order: i32,
}

impl CreatePlan {
    /// A visible monthly plan with no trial or grace period.
    pub fn monthly(slug: &str, name: &str, price: Decimal) -> Self {
        Self {
            slug: slug.to_string(),
            name: name.to_string(),
            description: None,
            price,
            signup_fee: Decimal::ZERO,
            currency: "USD".to_string(),
            billing_type: BillingType::Fixed,
            trial_period: 0,
            trial_interval: Interval::Day,
            invoice_period: 1,
            invoice_interval: Interval::Month,
            grace_period: 0,
            grace_interval: Interval::Day,
            is_visible: true,
            sort_order: 0,
        }
    }

    pub(crate) fn into_plan(self, now: DateTime<Utc>) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            slug: self.slug,
            name: self.name,
            description: self.description,
            price: self.price,
            signup_fee: self.signup_fee,
            currency: self.currency,
            billing_type: self.billing_type.as_str().to_string(),
            trial_period: self.trial_period,
            trial_interval: self.trial_interval.as_str().to_string(),
            invoice_period: self.invoice_period,
            invoice_interval: self.invoice_interval.as_str().to_string(),
            grace_period: self.grace_period,
            grace_interval: self.grace_interval.as_str().to_string(),
            is_active: true,
            is_visible: self.is_visible,
            sort_order: self.sort_order,
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        }
    }
}

/// Filter parameters for listing plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListPlansFilter {
    pub only_active: bool,
    pub only_visible: bool,
}

impl ListPlansFilter {
    pub fn matches(&self, plan: &Plan) -> bool {
        plan.deleted_utc.is_none()
            && (!self.only_active || plan.is_active)
            && (!self.only_visible || plan.is_visible)
    }
}
