//! Subscription model.

use crate::error::{Result, SubscriptionError};
use crate::models::period::Period;
use crate::models::plan::Plan;
use crate::models::subscriber::SubscriberRef;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state derived from the stored timestamps and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Trial,
    Active,
    CanceledPending,
    Ended,
    Inactive,
    Deleted,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Trial => "trial",
            SubscriptionState::Active => "active",
            SubscriptionState::CanceledPending => "canceled_pending",
            SubscriptionState::Ended => "ended",
            SubscriptionState::Inactive => "inactive",
            SubscriptionState::Deleted => "deleted",
        }
    }
}

/// Subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub subscriber_type: String,
    pub subscriber_id: String,
    pub plan_id: Uuid,
    pub name: String,
    pub billing_type: String,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub cancels_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_paid: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Build a new active subscription: a trial window anchored at `start`
    /// followed by one billing period anchored at the end of the trial.
    pub fn start(
        input: NewSubscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let trial = plan.trial_window(input.start.unwrap_or(now))?;
        let period = plan.billing_window(trial.end())?;

        Ok(Self {
            subscription_id: Uuid::new_v4(),
            subscriber_type: input.subscriber.kind,
            subscriber_id: input.subscriber.id,
            plan_id: plan.plan_id,
            name: input.name,
            billing_type: plan.billing_type.clone(),
            trial_ends_at: Some(trial.end()),
            starts_at: Some(period.start()),
            ends_at: Some(period.end()),
            cancels_at: None,
            canceled_at: None,
            is_active: true,
            is_paid: false,
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        })
    }

    pub fn subscriber(&self) -> SubscriberRef {
        SubscriberRef::new(self.subscriber_type.clone(), self.subscriber_id.clone())
    }

    pub fn belongs_to(&self, subscriber: &SubscriberRef) -> bool {
        self.subscriber_type == subscriber.kind && self.subscriber_id == subscriber.id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_utc.is_some()
    }

    pub fn active(&self) -> bool {
        self.is_active && !self.is_deleted()
    }

    pub fn inactive(&self) -> bool {
        !self.active()
    }

    pub fn on_trial(&self, now: DateTime<Utc>) -> bool {
        self.trial_ends_at.is_some_and(|at| now < at)
    }

    pub fn canceled(&self, now: DateTime<Utc>) -> bool {
        self.canceled_at.is_some_and(|at| now >= at)
    }

    pub fn ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|at| now >= at)
    }

    pub fn state(&self, now: DateTime<Utc>) -> SubscriptionState {
        if self.is_deleted() {
            SubscriptionState::Deleted
        } else if self.ended(now) {
            SubscriptionState::Ended
        } else if self.canceled_at.is_some() {
            SubscriptionState::CanceledPending
        } else if !self.is_active {
            SubscriptionState::Inactive
        } else if self.on_trial(now) {
            SubscriptionState::Trial
        } else {
            SubscriptionState::Active
        }
    }

    /// Mark as canceled at `now`; an immediate cancellation also ends the
    /// billing period at `now`.
    pub fn cancel(&mut self, now: DateTime<Utc>, immediately: bool) {
        self.canceled_at = Some(now);
        self.is_active = false;
        if immediately {
            self.ends_at = Some(now);
        }
        self.updated_utc = now;
    }

    /// Replace the billing window.
    pub fn set_period(&mut self, period: &Period) {
        self.starts_at = Some(period.start());
        self.ends_at = Some(period.end());
    }

    /// A subscription that has both ended and been canceled must be replaced
    /// rather than renewed.
    pub fn ensure_renewable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.ended(now) && self.canceled(now) {
            return Err(SubscriptionError::InvalidState(format!(
                "subscription {} is canceled and ended; create a new subscription instead",
                self.subscription_id
            )));
        }
        Ok(())
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscriber: SubscriberRef,
    pub name: String,
    /// Trial anchor; defaults to the current instant.
    pub start: Option<DateTime<Utc>>,
}

impl NewSubscription {
    pub fn new(subscriber: SubscriberRef, name: &str) -> Self {
        Self {
            subscriber,
            name: name.to_string(),
            start: None,
        }
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }
}

/// Default look-ahead for the "ending soon" queries.
pub const DEFAULT_DAY_RANGE: i64 = 3;

/// `now` plus `days`; `None` when the result leaves the timestamp range.
pub fn look_ahead(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|delta| now.checked_add_signed(delta))
}

/// Filter predicates over stored subscription fields, for lookups and
/// external expiry sweeps. Soft-deleted rows never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionQuery {
    OfSubscriber(SubscriberRef),
    ByPlan(Uuid),
    Active,
    EndingTrial { days: i64 },
    EndedTrial,
    EndingPeriod { days: i64 },
    EndedPeriod,
}

impl SubscriptionQuery {
    pub fn ending_trial() -> Self {
        SubscriptionQuery::EndingTrial {
            days: DEFAULT_DAY_RANGE,
        }
    }

    pub fn ending_period() -> Self {
        SubscriptionQuery::EndingPeriod {
            days: DEFAULT_DAY_RANGE,
        }
    }

    /// Fails with `InvalidCount` when a look-ahead window cannot be
    /// represented.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        match self {
            SubscriptionQuery::EndingTrial { days } | SubscriptionQuery::EndingPeriod { days } => {
                look_ahead(now, *days)
                    .map(|_| ())
                    .ok_or(SubscriptionError::InvalidCount(*days))
            }
            _ => Ok(()),
        }
    }

    /// An unrepresentable look-ahead window matches nothing.
    pub fn matches(&self, subscription: &Subscription, now: DateTime<Utc>) -> bool {
        if subscription.is_deleted() {
            return false;
        }
        let within = |at: Option<DateTime<Utc>>, days: i64| match look_ahead(now, days) {
            Some(horizon) => at.is_some_and(|at| at >= now && at <= horizon),
            None => false,
        };
        match self {
            SubscriptionQuery::OfSubscriber(subscriber) => subscription.belongs_to(subscriber),
            SubscriptionQuery::ByPlan(plan_id) => subscription.plan_id == *plan_id,
            SubscriptionQuery::Active => subscription.is_active,
            SubscriptionQuery::EndingTrial { days } => within(subscription.trial_ends_at, *days),
            SubscriptionQuery::EndedTrial => subscription.trial_ends_at.is_some_and(|at| at <= now),
            SubscriptionQuery::EndingPeriod { days } => within(subscription.ends_at, *days),
            SubscriptionQuery::EndedPeriod => subscription.ends_at.is_some_and(|at| at <= now),
        }
    }
}
