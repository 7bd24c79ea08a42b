//! Operator-facing administrative operations (§4.5).
//!
//! These are plain async functions over a [`Store`], not a REST surface —
//! exposing them over HTTP is the job of the wider platform, out of scope
//! here. Each wraps its store call in [`retry_on_conflict`] since, like
//! every other state-machine operation, these can roll back on a row-lock
//! conflict and are safe to simply retry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::dispatcher::retry_on_conflict;
use crate::error::StoreResult;
use crate::model::{WorkUnit, WorkUnitState};
use crate::store::Store;

/// §4.5 `rerun(work_unit_id)` — single re-run of a `Succeeded` unit.
pub async fn rerun(store: &Arc<dyn Store>, work_unit_id: i64) -> StoreResult<WorkUnit> {
    retry_on_conflict(|| store.rerun(work_unit_id)).await
}

/// §4.5 `rerun_all(payload_type, [from, to])`. Refuses if any `Pending`
/// work of that type exists, to avoid corrupting
/// `num_unsatisfied_requirements` bookkeeping (see `rerun`'s own doc note).
pub async fn rerun_all(
    store: &Arc<dyn Store>,
    payload_type: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> StoreResult<i64> {
    retry_on_conflict(|| store.rerun_all(payload_type, from, to)).await
}

/// §4.5 `mark_all_as_feasible(payload_type)`.
pub async fn mark_all_as_feasible(store: &Arc<dyn Store>, payload_type: &str) -> StoreResult<i64> {
    retry_on_conflict(|| store.mark_all_as_feasible(payload_type)).await
}

/// §4.5 `recompute_counts()`.
pub async fn recompute_counts(store: &Arc<dyn Store>) -> StoreResult<()> {
    retry_on_conflict(|| store.recompute_counts()).await
}

/// §4.5 `check_unsatisfied_requirements(work_unit_id)`. Warns when a repair
/// actually occurs, per §7: an invariant violation here is always
/// operator-visible.
pub async fn check_unsatisfied_requirements(
    store: &Arc<dyn Store>,
    work_unit_id: i64,
) -> StoreResult<Option<i32>> {
    let corrected = retry_on_conflict(|| store.check_num_unsatisfied_requirements(work_unit_id)).await?;
    if let Some(count) = corrected {
        tracing::warn!(work_unit_id, corrected_count = count, "repaired drifted num_unsatisfied_requirements");
    }
    Ok(corrected)
}

/// §4.5 `counts_by_type_and_state()` — the monitoring read path.
pub async fn counts_by_type_and_state(
    store: &Arc<dyn Store>,
) -> StoreResult<HashMap<(String, WorkUnitState), i64>> {
    store.counts_by_type_and_state().await
}
