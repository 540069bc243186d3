//! Plan module model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An application area switched on for every subscriber of a plan.
/// Modules carry no quota; a plan either has one or it doesn't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PlanModule {
    pub module_id: Uuid,
    pub plan_id: Uuid,
    pub module: String,
    pub created_utc: DateTime<Utc>,
}

impl PlanModule {
    pub fn new(plan_id: Uuid, module: &str, now: DateTime<Utc>) -> Self {
        Self {
            module_id: Uuid::new_v4(),
            plan_id,
            module: module.trim().to_string(),
            created_utc: now,
        }
    }
}
