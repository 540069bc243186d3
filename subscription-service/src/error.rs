//! Domain errors for subscription-service.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SubscriptionError>;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid interval \"{0}\". Must be one of: day, week, month, year")]
    InvalidInterval(String),

    #[error("Invalid count {0}: count must be a non-negative integer within the calendar range")]
    InvalidCount(i64),

    #[error("Invalid feature value {0}: must be -1 (unlimited), 0 (disabled) or a positive quota")]
    InvalidFeatureValue(i64),

    #[error("Plan {plan_id} already has a feature with slug \"{slug}\"")]
    DuplicateFeatureSlug { plan_id: Uuid, slug: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl SubscriptionError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SubscriptionError::InvalidInterval(_) => "invalid_interval",
            SubscriptionError::InvalidCount(_) => "invalid_count",
            SubscriptionError::InvalidFeatureValue(_) => "invalid_feature_value",
            SubscriptionError::DuplicateFeatureSlug { .. } => "duplicate_feature_slug",
            SubscriptionError::InvalidState(_) => "invalid_state",
            SubscriptionError::NotFound(_) => "not_found",
            SubscriptionError::Storage(e) => e.kind(),
        }
    }

    pub(crate) fn database(context: &str, err: impl std::fmt::Display) -> Self {
        SubscriptionError::Storage(AppError::DatabaseError(anyhow::anyhow!(
            "{}: {}",
            context,
            err
        )))
    }
}

impl From<SubscriptionError> for AppError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Storage(inner) => inner,
            SubscriptionError::DuplicateFeatureSlug { .. } | SubscriptionError::InvalidState(_) => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            SubscriptionError::NotFound(_) => AppError::NotFound(anyhow::Error::new(err)),
            SubscriptionError::InvalidInterval(_)
            | SubscriptionError::InvalidCount(_)
            | SubscriptionError::InvalidFeatureValue(_) => {
                AppError::BadRequest(anyhow::Error::new(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_app_errors() {
        let err: AppError = SubscriptionError::InvalidInterval("fortnight".into()).into();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err: AppError = SubscriptionError::DuplicateFeatureSlug {
            plan_id: Uuid::nil(),
            slug: "seats".into(),
        }
        .into();
        assert!(matches!(err, AppError::Conflict(_)));

        let err: AppError = SubscriptionError::NotFound("feature".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_storage_errors_pass_through() {
        let err = SubscriptionError::database("Failed to get plan", "connection reset");
        assert_eq!(err.kind(), "database");
        let app: AppError = err.into();
        assert!(app.to_string().contains("connection reset"));
    }
}
