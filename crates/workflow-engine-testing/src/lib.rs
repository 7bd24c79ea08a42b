//! An in-memory [`Store`] for tests and demos.
//!
//! Implements the same state-machine semantics as `workflow-engine-postgres`
//! without a database: a single mutex guards an in-memory table, edge set,
//! delta journal, and shard map. Because every operation already holds the
//! mutex for its whole body there is no real concurrency to deadlock on, so
//! `StoreError::Retryable` is never returned here except when explicitly
//! injected via [`InMemoryStore::fail_next_add_requirement`] — useful for
//! exercising the dispatcher's `retry_on_conflict` path in a test without a
//! real database to race against.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use workflow_engine::{
    DispatchOutcome, ExceptionCategory, LeaseOutcome, NewWorkUnit, RequirementEdge,
    StateCountDelta, StateCountKey, Store, StoreError, StoreResult, WorkException, WorkUnit,
    WorkUnitState, WorkUnitStateOrd,
};

const DEFAULT_SHARD_COUNT: u32 = 50;

struct Inner {
    next_id: i64,
    units: HashMap<i64, WorkUnit>,
    edges: HashSet<(i64, i64)>,
    next_delta_id: i64,
    deltas: Vec<StateCountDelta>,
    shards: HashMap<(StateCountKey, u32), i64>,
    shard_count: u32,
    next_exception_id: i64,
    exceptions: Vec<WorkException>,
}

impl Inner {
    fn new(shard_count: u32) -> Self {
        Self {
            next_id: 1,
            units: HashMap::new(),
            edges: HashSet::new(),
            next_delta_id: 1,
            deltas: Vec::new(),
            shards: HashMap::new(),
            shard_count,
            next_exception_id: 1,
            exceptions: Vec::new(),
        }
    }

    fn fetch(&self, id: i64) -> StoreResult<WorkUnit> {
        self.units.get(&id).cloned().ok_or(StoreError::NotFound { id })
    }

    fn assert_state(&self, unit: &WorkUnit, expected: &[WorkUnitState]) -> StoreResult<()> {
        if expected.contains(&unit.state) {
            Ok(())
        } else {
            Err(StoreError::contract_violation(unit.id, expected, unit.state))
        }
    }

    fn push_delta(&mut self, payload_type: &str, from: Option<WorkUnitState>, to: Option<WorkUnitState>, delta: i64) {
        let id = self.next_delta_id;
        self.next_delta_id += 1;
        self.deltas.push(StateCountDelta {
            id,
            payload_type: payload_type.to_string(),
            from_state: from,
            to_state: to,
            delta,
        });
    }

    fn transition(&mut self, id: i64, to: WorkUnitState) {
        let unit = self.units.get_mut(&id).expect("transition target must exist");
        let from = unit.state;
        let payload_type = unit.payload_type.clone();
        unit.state = to;
        self.push_delta(&payload_type, Some(from), Some(to), 1);
    }

    fn insert_new(&mut self, new: NewWorkUnit) -> WorkUnit {
        let id = self.next_id;
        self.next_id += 1;
        let unit = WorkUnit {
            id,
            payload_type: new.payload_type,
            payload: new.payload,
            state: WorkUnitState::Ready,
            num_unsatisfied_requirements: 0,
            creator_id: new.creator_id,
            created_at: Utc::now(),
            last_attempt_at: None,
            succeeded_at: None,
            leased_until: None,
            lease_holder: None,
            node: String::new(),
            description: new.description,
        };
        self.units.insert(id, unit.clone());
        unit
    }

    fn direct_requirers(&self, target_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .edges
            .iter()
            .filter(|(_, t)| *t == target_id)
            .map(|(s, _)| *s)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn direct_requirements(&self, source_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .edges
            .iter()
            .filter(|(s, _)| *s == source_id)
            .map(|(_, t)| *t)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn gather_transitive_requirers(&self, target_id: i64, visited: &mut HashSet<i64>) {
        for requirer in self.direct_requirers(target_id) {
            if visited.insert(requirer) {
                self.gather_transitive_requirers(requirer, visited);
            }
        }
    }

    /// §4.2.4 `requirement_satisfied`: `target_id` just left the state it
    /// was in towards `Succeeded` (or became permanently `Infeasible`);
    /// re-evaluate every direct requirer of it.
    fn requirement_satisfied(&mut self, requirer_id: i64, target_became_infeasible: bool, rerun_if_succeeded: bool) {
        let requirer = self.units.get(&requirer_id).cloned();
        let Some(requirer) = requirer else { return };

        match requirer.state {
            WorkUnitState::Pending => {
                let remaining = requirer.num_unsatisfied_requirements - 1;
                self.units.get_mut(&requirer_id).unwrap().num_unsatisfied_requirements = remaining;
                if target_became_infeasible {
                    self.transition(requirer_id, WorkUnitState::Infeasible);
                } else if remaining <= 0 {
                    let now = Utc::now();
                    let scheduled_future = self
                        .units
                        .get(&requirer_id)
                        .unwrap()
                        .scheduled_for_future(now);
                    if scheduled_future {
                        self.transition(requirer_id, WorkUnitState::Leased);
                    } else {
                        self.transition(requirer_id, WorkUnitState::Ready);
                    }
                }
            }
            WorkUnitState::Succeeded => {
                if rerun_if_succeeded {
                    self.rerun_locked(requirer_id);
                }
            }
            WorkUnitState::Leased => {
                let remaining = requirer.num_unsatisfied_requirements - 1;
                self.units.get_mut(&requirer_id).unwrap().num_unsatisfied_requirements = remaining;
            }
            WorkUnitState::Infeasible => {
                let actual = self.actual_unsatisfied_count(requirer_id);
                self.units.get_mut(&requirer_id).unwrap().num_unsatisfied_requirements = actual;
                if actual == 0 {
                    self.transition(requirer_id, WorkUnitState::Ready);
                }
            }
            WorkUnitState::Ready => {}
        }
    }

    fn actual_unsatisfied_count(&self, id: i64) -> i32 {
        self.direct_requirements(id)
            .into_iter()
            .filter(|target_id| {
                self.units
                    .get(target_id)
                    .map(|t| t.state != WorkUnitState::Succeeded)
                    .unwrap_or(true)
            })
            .count() as i32
    }

    fn rerun_locked(&mut self, id: i64) -> WorkUnit {
        for requirer_id in self.direct_requirers(id) {
            if let Some(requirer) = self.units.get(&requirer_id) {
                if requirer.state == WorkUnitState::Pending {
                    self.units.get_mut(&requirer_id).unwrap().num_unsatisfied_requirements += 1;
                }
            }
        }
        self.transition(id, WorkUnitState::Ready);
        self.units.get(&id).unwrap().clone()
    }
}

/// An in-memory [`Store`]. Cloning shares the backing state (it's an `Arc`
/// internally via the caller wrapping it, matching how `PgJobStore` wraps a
/// pool) — construct one and hand out `Arc<dyn Store>` the same way a real
/// deployment would hand out a connection-pooled store.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    fail_next_add_requirement: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_shard_count(DEFAULT_SHARD_COUNT)
    }

    pub fn with_shard_count(shard_count: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::new(shard_count)),
            fail_next_add_requirement: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` calls to `add_requirement` return
    /// `StoreError::Retryable` before actually applying the edge, to exercise
    /// a dispatcher or admin caller's retry loop the same way a real
    /// deadlock would.
    pub fn fail_next_add_requirement(&self, n: usize) {
        self.fail_next_add_requirement.store(n, Ordering::SeqCst);
    }

    pub fn requirement_edges(&self) -> Vec<RequirementEdge> {
        self.inner
            .lock()
            .unwrap()
            .edges
            .iter()
            .map(|(source_id, target_id)| RequirementEdge {
                source_id: *source_id,
                target_id: *target_id,
            })
            .collect()
    }

    pub fn exceptions_for(&self, work_unit_id: i64) -> Vec<WorkException> {
        self.inner
            .lock()
            .unwrap()
            .exceptions
            .iter()
            .filter(|e| e.work_unit_id == work_unit_id)
            .cloned()
            .collect()
    }

    pub fn pending_delta_count(&self) -> usize {
        self.inner.lock().unwrap().deltas.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create(&self, new: NewWorkUnit) -> StoreResult<WorkUnit> {
        let mut inner = self.inner.lock().unwrap();
        let payload_type = new.payload_type.clone();
        let unit = inner.insert_new(new);
        inner.push_delta(&payload_type, None, Some(WorkUnitState::Ready), 1);
        Ok(unit)
    }

    async fn bulk_create(&self, news: Vec<NewWorkUnit>) -> StoreResult<Vec<WorkUnit>> {
        if news.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().unwrap();
        let mut created = Vec::with_capacity(news.len());
        let mut counts: HashMap<String, i64> = HashMap::new();
        for new in news {
            *counts.entry(new.payload_type.clone()).or_insert(0) += 1;
            created.push(inner.insert_new(new));
        }
        for (payload_type, count) in counts {
            inner.push_delta(&payload_type, None, Some(WorkUnitState::Ready), count);
        }
        Ok(created)
    }

    async fn fetch(&self, id: i64) -> StoreResult<WorkUnit> {
        self.inner.lock().unwrap().fetch(id)
    }

    async fn get_by_state(&self, payload_type: &str, state: WorkUnitState) -> StoreResult<Vec<WorkUnit>> {
        let inner = self.inner.lock().unwrap();
        let mut units: Vec<WorkUnit> = inner
            .units
            .values()
            .filter(|u| u.payload_type == payload_type && u.state == state)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.id);
        Ok(units)
    }

    async fn add_requirement(&self, source_id: i64, target_id: i64) -> StoreResult<bool> {
        if self.fail_next_add_requirement.load(Ordering::SeqCst) > 0 {
            self.fail_next_add_requirement.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Retryable);
        }

        let mut inner = self.inner.lock().unwrap();
        let source = inner.fetch(source_id)?;
        inner.assert_state(
            &source,
            &[WorkUnitState::Pending, WorkUnitState::Ready, WorkUnitState::Leased],
        )?;

        if !inner.edges.insert((source_id, target_id)) {
            return Ok(false);
        }

        let Some(target) = inner.units.get(&target_id).cloned() else {
            return Ok(true);
        };

        if target.state == WorkUnitState::Succeeded {
            return Ok(true);
        }

        inner.units.get_mut(&source_id).unwrap().num_unsatisfied_requirements += 1;

        if target.state == WorkUnitState::Infeasible {
            inner.transition(source_id, WorkUnitState::Infeasible);
        } else if source.state != WorkUnitState::Pending {
            inner.transition(source_id, WorkUnitState::Pending);
        }

        Ok(true)
    }

    async fn create_requirements(&self, source_id: i64, targets: Vec<NewWorkUnit>) -> StoreResult<Vec<WorkUnit>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().unwrap();
        let source = inner.fetch(source_id)?;
        inner.assert_state(
            &source,
            &[WorkUnitState::Pending, WorkUnitState::Ready, WorkUnitState::Leased],
        )?;

        let mut counts: HashMap<String, i64> = HashMap::new();
        let mut created = Vec::with_capacity(targets.len());
        for new in targets {
            *counts.entry(new.payload_type.clone()).or_insert(0) += 1;
            let unit = inner.insert_new(new);
            inner.edges.insert((source_id, unit.id));
            created.push(unit);
        }
        for (payload_type, count) in counts {
            inner.push_delta(&payload_type, None, Some(WorkUnitState::Ready), count);
        }

        inner.units.get_mut(&source_id).unwrap().num_unsatisfied_requirements += created.len() as i32;
        if source.state == WorkUnitState::Ready {
            inner.transition(source_id, WorkUnitState::Pending);
        }

        Ok(created)
    }

    async fn claim_ready(
        &self,
        payload_type: &str,
        limit: i64,
        node: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<Vec<WorkUnit>> {
        let mut inner = self.inner.lock().unwrap();
        let mut candidates: Vec<i64> = inner
            .units
            .values()
            .filter(|u| {
                u.payload_type == payload_type
                    && u.state == WorkUnitState::Ready
                    && !u.scheduled_for_future(now)
            })
            .map(|u| u.id)
            .collect();
        candidates.sort_unstable();
        candidates.truncate(limit.max(0) as usize);

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            leased.push(take_lease_locked(&mut inner, id, node, now, ttl)?);
        }
        Ok(leased)
    }

    async fn take_lease(&self, id: i64, node: &str, now: DateTime<Utc>, ttl: Duration) -> StoreResult<WorkUnit> {
        let mut inner = self.inner.lock().unwrap();
        take_lease_locked(&mut inner, id, node, now, ttl)
    }

    async fn revoke_lease(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.fetch(id)?;
        inner.assert_state(&unit, &[WorkUnitState::Leased])?;
        let new_state = if unit.num_unsatisfied_requirements == 0 {
            WorkUnitState::Ready
        } else {
            WorkUnitState::Pending
        };
        inner.transition(id, new_state);
        inner.fetch(id)
    }

    async fn apply_outcome_if_leased(
        &self,
        id: i64,
        expected_holder: Uuid,
        outcome: DispatchOutcome,
    ) -> StoreResult<LeaseOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.fetch(id)?;
        if unit.state != WorkUnitState::Leased || unit.lease_holder != Some(expected_holder) {
            return Ok(LeaseOutcome::StaleLease);
        }

        match outcome {
            DispatchOutcome::Succeeded => {
                work_succeeded_locked(&mut inner, id);
            }
            DispatchOutcome::Infeasible => {
                permanent_error_locked(&mut inner, id)?;
            }
            DispatchOutcome::Reschedule(until) => {
                inner.units.get_mut(&id).unwrap().leased_until = Some(until);
            }
        }
        Ok(LeaseOutcome::Applied)
    }

    async fn work_succeeded(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.fetch(id)?;
        inner.assert_state(&unit, &[WorkUnitState::Leased])?;
        work_succeeded_locked(&mut inner, id);
        inner.fetch(id)
    }

    async fn permanent_error(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.fetch(id)?;
        inner.assert_state(&unit, &[WorkUnitState::Leased])?;
        permanent_error_locked(&mut inner, id)?;
        inner.fetch(id)
    }

    async fn rerun(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.fetch(id)?;
        inner.assert_state(&unit, &[WorkUnitState::Succeeded])?;
        Ok(inner.rerun_locked(id))
    }

    async fn rerun_all(
        &self,
        payload_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let pending_count = inner
            .units
            .values()
            .filter(|u| u.payload_type == payload_type && u.state == WorkUnitState::Pending)
            .count();
        if pending_count > 0 {
            return Err(StoreError::PendingWorkOutstanding {
                operation: "rerun_all",
                count: pending_count as i64,
            });
        }

        let mut ids: Vec<i64> = inner
            .units
            .values()
            .filter(|u| {
                u.payload_type == payload_type
                    && u.state == WorkUnitState::Succeeded
                    && from.is_none_or(|f| u.created_at >= f)
                    && to.is_none_or(|t| u.created_at <= t)
            })
            .map(|u| u.id)
            .collect();
        ids.sort_unstable();

        for id in &ids {
            inner.rerun_locked(*id);
        }
        Ok(ids.len() as i64)
    }

    async fn mark_as_feasible(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.fetch(id)?;
        inner.assert_state(&unit, &[WorkUnitState::Infeasible])?;
        let new_state = if unit.num_unsatisfied_requirements == 0 {
            WorkUnitState::Ready
        } else {
            WorkUnitState::Pending
        };
        inner.transition(id, new_state);
        inner.fetch(id)
    }

    async fn mark_all_as_feasible(&self, payload_type: &str) -> StoreResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<i64> = inner
            .units
            .values()
            .filter(|u| {
                u.payload_type == payload_type
                    && u.state == WorkUnitState::Infeasible
                    && u.num_unsatisfied_requirements == 0
            })
            .map(|u| u.id)
            .collect();
        for id in &ids {
            inner.transition(*id, WorkUnitState::Ready);
        }
        Ok(ids.len() as i64)
    }

    async fn check_num_unsatisfied_requirements(&self, id: i64) -> StoreResult<Option<i32>> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.fetch(id)?;
        inner.assert_state(&unit, &[WorkUnitState::Pending, WorkUnitState::Infeasible])?;
        let actual = inner.actual_unsatisfied_count(id);
        if actual == unit.num_unsatisfied_requirements {
            return Ok(None);
        }
        inner.units.get_mut(&id).unwrap().num_unsatisfied_requirements = actual;
        if actual == 0 && unit.state == WorkUnitState::Pending {
            inner.transition(id, WorkUnitState::Ready);
        }
        Ok(Some(actual))
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<i64> = inner
            .units
            .values()
            .filter(|u| u.state == WorkUnitState::Leased && u.leased_until.is_some_and(|t| t <= now))
            .map(|u| u.id)
            .collect();
        for id in &ids {
            let unit = inner.units.get(id).unwrap();
            let new_state = if unit.num_unsatisfied_requirements == 0 {
                WorkUnitState::Ready
            } else {
                WorkUnitState::Pending
            };
            inner.transition(*id, new_state);
        }
        Ok(ids.len() as u64)
    }

    async fn log_exception(
        &self,
        work_unit_id: i64,
        category: ExceptionCategory,
        message: &str,
        stacktrace: &str,
    ) -> StoreResult<WorkException> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_exception_id;
        inner.next_exception_id += 1;
        let exception = WorkException {
            id,
            timestamp: Utc::now(),
            category,
            work_unit_id,
            message: message.to_string(),
            stacktrace: stacktrace.to_string(),
        };
        inner.exceptions.push(exception.clone());
        Ok(exception)
    }

    async fn apply_counter_deltas(&self, limit: i64) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let take = limit.max(0) as usize;
        if inner.deltas.is_empty() || take == 0 {
            return Ok(0);
        }
        let drained: Vec<StateCountDelta> = if take >= inner.deltas.len() {
            std::mem::take(&mut inner.deltas)
        } else {
            inner.deltas.drain(0..take).collect()
        };

        let mut aggregate: HashMap<StateCountKey, i64> = HashMap::new();
        for delta in &drained {
            if let Some(from) = delta.from_state {
                let key = StateCountKey {
                    payload_type: delta.payload_type.clone(),
                    state: WorkUnitStateOrd(from),
                };
                *aggregate.entry(key).or_insert(0) -= delta.delta;
            }
            if let Some(to) = delta.to_state {
                let key = StateCountKey {
                    payload_type: delta.payload_type.clone(),
                    state: WorkUnitStateOrd(to),
                };
                *aggregate.entry(key).or_insert(0) += delta.delta;
            }
        }

        let mut keys: Vec<StateCountKey> = aggregate.keys().cloned().collect();
        keys.sort();
        let shard_count = inner.shard_count;
        for key in keys {
            let delta = aggregate[&key];
            let shard = fastrand::u32(0..shard_count.max(1));
            *inner.shards.entry((key, shard)).or_insert(0) += delta;
        }

        Ok(drained.len() as u64)
    }

    async fn counts_by_type_and_state(&self) -> StoreResult<HashMap<(String, WorkUnitState), i64>> {
        let inner = self.inner.lock().unwrap();
        let mut totals: HashMap<(String, WorkUnitState), i64> = HashMap::new();
        for ((key, _shard), count) in &inner.shards {
            *totals.entry((key.payload_type.clone(), key.state.0)).or_insert(0) += count;
        }
        Ok(totals)
    }

    async fn recompute_counts(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.deltas.is_empty() {
            return Err(StoreError::DeltasOutstanding { count: inner.deltas.len() as i64 });
        }

        let mut totals: HashMap<StateCountKey, i64> = HashMap::new();
        for unit in inner.units.values() {
            let key = StateCountKey {
                payload_type: unit.payload_type.clone(),
                state: WorkUnitStateOrd(unit.state),
            };
            *totals.entry(key).or_insert(0) += 1;
        }

        inner.shards.clear();
        for (key, count) in totals {
            inner.shards.insert((key, 0), count);
        }
        Ok(())
    }
}

fn take_lease_locked(inner: &mut Inner, id: i64, node: &str, now: DateTime<Utc>, ttl: Duration) -> StoreResult<WorkUnit> {
    let unit = inner.fetch(id)?;
    inner.assert_state(&unit, &[WorkUnitState::Ready])?;
    {
        let unit = inner.units.get_mut(&id).unwrap();
        unit.lease_holder = Some(Uuid::new_v4());
        unit.leased_until = Some(now + ttl);
        unit.last_attempt_at = Some(now);
        unit.node = node.to_string();
    }
    inner.transition(id, WorkUnitState::Leased);
    inner.fetch(id)
}

fn work_succeeded_locked(inner: &mut Inner, id: i64) {
    {
        let unit = inner.units.get_mut(&id).unwrap();
        unit.succeeded_at = Some(unit.last_attempt_at.unwrap_or_else(Utc::now));
    }
    inner.transition(id, WorkUnitState::Succeeded);
    for requirer_id in inner.direct_requirers(id) {
        inner.requirement_satisfied(requirer_id, false, true);
    }
}

fn permanent_error_locked(inner: &mut Inner, id: i64) -> StoreResult<()> {
    let mut visited = HashSet::new();
    inner.gather_transitive_requirers(id, &mut visited);

    let mut ids: Vec<i64> = visited.into_iter().collect();
    ids.sort_unstable();

    for requirer_id in &ids {
        let requirer = inner.fetch(*requirer_id)?;
        if requirer.state == WorkUnitState::Infeasible {
            continue;
        }
        inner.assert_state(&requirer, &[WorkUnitState::Pending, WorkUnitState::Succeeded])?;
        inner.transition(*requirer_id, WorkUnitState::Infeasible);
    }

    inner.transition(id, WorkUnitState::Infeasible);
    Ok(())
}
