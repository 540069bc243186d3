//! Subscription Service - Plan entitlements, feature quotas and the single-active-subscription rule.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;
