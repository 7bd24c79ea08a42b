use thiserror::Error;

use crate::model::WorkUnitState;

/// Errors raised by a [`crate::store::Store`] implementation.
///
/// `Retryable` is the load-bearing variant: the dispatcher (and any admin
/// operation that composes several store calls) catches it and retries the
/// whole logical operation after a jittered backoff. It must never escape
/// to handler code.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient storage conflict (deadlock or serialization failure), retry")]
    Retryable,

    #[error("work unit {id} not found")]
    NotFound { id: i64 },

    #[error(
        "contract violation: work unit {id} expected to be in {expected:?}, was {actual:?}"
    )]
    ContractViolation {
        id: i64,
        expected: Vec<WorkUnitState>,
        actual: WorkUnitState,
    },

    #[error(
        "refusing to {operation}: {count} PENDING work unit(s) outstanding would have their \
         num_unsatisfied_requirements miscounted"
    )]
    PendingWorkOutstanding { operation: &'static str, count: i64 },

    #[error("refusing to recompute counts: {count} delta journal row(s) still outstanding")]
    DeltasOutstanding { count: i64 },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn contract_violation(id: i64, expected: &[WorkUnitState], actual: WorkUnitState) -> Self {
        StoreError::ContractViolation {
            id,
            expected: expected.to_vec(),
            actual,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
