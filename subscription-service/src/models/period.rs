//! Calendar period model.

use crate::error::{Result, SubscriptionError};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interval unit for billing, trial, grace and reset periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Day,
    Week,
    Month,
    Year,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Year => "year",
        }
    }
}

impl FromStr for Interval {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            "year" => Ok(Interval::Year),
            other => Err(SubscriptionError::InvalidInterval(other.to_string())),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A window of `count` intervals starting at `start`.
///
/// Months and years follow calendar rollover with end-of-month clamping, so
/// one month after January 31st is the last day of February.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    interval: Interval,
    count: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Period {
    pub fn new(interval: Interval, count: i32, start: DateTime<Utc>) -> Result<Self> {
        if count < 0 {
            return Err(SubscriptionError::InvalidCount(count.into()));
        }

        let end = match interval {
            Interval::Day => start.checked_add_signed(Duration::days(count.into())),
            Interval::Week => start.checked_add_signed(Duration::weeks(count.into())),
            Interval::Month => start.checked_add_months(Months::new(count.unsigned_abs())),
            Interval::Year => count
                .checked_mul(12)
                .and_then(|months| start.checked_add_months(Months::new(months.unsigned_abs()))),
        }
        .ok_or(SubscriptionError::InvalidCount(count.into()))?;

        Ok(Self {
            interval,
            count,
            start,
            end,
        })
    }

    /// Compute a period from the stored string form of the interval.
    pub fn parse(interval: &str, count: i32, start: DateTime<Utc>) -> Result<Self> {
        Self::new(interval.parse()?, count, start)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn count(&self) -> i32 {
        self.count
    }
}
