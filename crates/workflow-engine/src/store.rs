use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::model::{ExceptionCategory, NewWorkUnit, WorkException, WorkUnit, WorkUnitState};

/// The outcome a dispatcher asks the store to apply to a leased work unit.
///
/// Applying one of these is always a single atomic operation: lock the row,
/// confirm it is still `Leased` and held by `expected_holder`, then branch.
/// Splitting the confirm and the apply into separate transactions would
/// reopen exactly the race the dispatcher exists to avoid (see
/// `SPEC_FULL.md` §4.3 step 4).
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Succeeded,
    Infeasible,
    Reschedule(DateTime<Utc>),
}

/// Whether `apply_outcome_if_leased` actually touched the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The lease still matched; the outcome was applied.
    Applied,
    /// The lease had already moved on (expired and reclaimed, or revoked);
    /// the result was silently discarded, as the spec requires.
    StaleLease,
}

/// Durable, transactional storage for the DAG dispatcher.
///
/// Every method here is one short transaction. Whenever an implementation
/// must lock more than one row to do its job, it locks them in strictly
/// ascending `id` order (see `SPEC_FULL.md` §5) — this is the single global
/// rule that keeps deadlocks survivable rather than catastrophic.
#[async_trait]
pub trait Store: Send + Sync {
    /// §4.2.1 — insert a payload's companion work unit in `Ready`, write one
    /// `(type, None -> Ready, +1)` delta.
    async fn create(&self, new: NewWorkUnit) -> StoreResult<WorkUnit>;

    /// §4.2.1 — `bulk_create`. One delta row covers the whole batch.
    async fn bulk_create(&self, news: Vec<NewWorkUnit>) -> StoreResult<Vec<WorkUnit>>;

    async fn fetch(&self, id: i64) -> StoreResult<WorkUnit>;

    async fn get_by_state(&self, payload_type: &str, state: WorkUnitState) -> StoreResult<Vec<WorkUnit>>;

    /// §4.2.2 — `add_requirement`. Returns `false` if the edge already
    /// existed (no-op).
    async fn add_requirement(&self, source_id: i64, target_id: i64) -> StoreResult<bool>;

    /// §4.2.3 — `create_requirements`, the brand-new-targets fast path.
    async fn create_requirements(
        &self,
        source_id: i64,
        targets: Vec<NewWorkUnit>,
    ) -> StoreResult<Vec<WorkUnit>>;

    /// §4.3 step 1-2 — claim up to `limit` `Ready` units of `payload_type`,
    /// in ascending id order, `SKIP LOCKED`, and lease each to `node` until
    /// `now + ttl`.
    async fn claim_ready(
        &self,
        payload_type: &str,
        limit: i64,
        node: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<Vec<WorkUnit>>;

    /// §4.2.5 — `take_lease` on a single already-known-`Ready` unit.
    async fn take_lease(
        &self,
        id: i64,
        node: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<WorkUnit>;

    /// §4.2.6 — `revoke_lease`. Used directly by the reaper.
    async fn revoke_lease(&self, id: i64) -> StoreResult<WorkUnit>;

    /// §4.3 step 4 — atomically confirm the lease is still held by
    /// `expected_holder` and apply `outcome`, or discard if stale.
    async fn apply_outcome_if_leased(
        &self,
        id: i64,
        expected_holder: Uuid,
        outcome: DispatchOutcome,
    ) -> StoreResult<LeaseOutcome>;

    /// §4.2.7 — `work_succeeded`, the pure state-machine transition (no
    /// lease-holder check; used directly by tests and admin tooling).
    async fn work_succeeded(&self, id: i64) -> StoreResult<WorkUnit>;

    /// §4.2.9 — `permanent_error`, including the transitive-requirer walk.
    async fn permanent_error(&self, id: i64) -> StoreResult<WorkUnit>;

    /// §4.2.8 — `rerun` a single `Succeeded` unit.
    async fn rerun(&self, id: i64) -> StoreResult<WorkUnit>;

    /// §4.5 — bulk rerun; refuses if any `Pending` unit of `payload_type`
    /// exists.
    async fn rerun_all(
        &self,
        payload_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<i64>;

    /// §4.2.10 — single-unit `mark_as_feasible`.
    async fn mark_as_feasible(&self, id: i64) -> StoreResult<WorkUnit>;

    /// §4.2.10 — bulk `mark_all_as_feasible`; exclusive table lock.
    async fn mark_all_as_feasible(&self, payload_type: &str) -> StoreResult<i64>;

    /// §4.2.11 — consistency repair. `Some(n)` if the stored count was
    /// wrong and has been corrected to `n`.
    async fn check_num_unsatisfied_requirements(&self, id: i64) -> StoreResult<Option<i32>>;

    /// §4.3 reaper — transition expired leases back to `Ready`/`Pending`.
    /// Returns the number reaped.
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn log_exception(
        &self,
        work_unit_id: i64,
        category: ExceptionCategory,
        message: &str,
        stacktrace: &str,
    ) -> StoreResult<WorkException>;

    /// §4.4 — drain up to `limit` delta rows into the sharded counters.
    /// Returns the number of journal rows consumed.
    async fn apply_counter_deltas(&self, limit: i64) -> StoreResult<u64>;

    async fn counts_by_type_and_state(&self) -> StoreResult<HashMap<(String, WorkUnitState), i64>>;

    /// §4.4 `recompute()` — refuses unless the delta journal is empty.
    async fn recompute_counts(&self) -> StoreResult<()>;
}
