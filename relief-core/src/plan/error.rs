use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan computed against snapshot v{planned}, store is at v{current}")]
    StaleSnapshot { planned: u64, current: u64 },
    #[error("plan {plan_id} does not fit the store: {reason}")]
    Inconsistent { plan_id: String, reason: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PlanError {
    pub(crate) fn inconsistent(plan_id: &str, reason: impl Into<String>) -> Self {
        PlanError::Inconsistent {
            plan_id: plan_id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type PlanResult<T> = std::result::Result<T, PlanError>;
