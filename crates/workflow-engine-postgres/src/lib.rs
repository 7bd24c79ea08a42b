//! PostgreSQL implementation of the `workflow-engine` `Store` trait.
//!
//! # Features
//!
//! - `FOR UPDATE SKIP LOCKED` claims, ascending-id row-lock ordering
//!   everywhere else, so any deadlock Postgres does detect is always
//!   recoverable by simply retrying the transaction.
//! - Sharded counters, drained from an append-only delta journal by a
//!   periodic applier.
//! - `gen_random_uuid()` per claimed lease; no client-side UUID generation
//!   races with a concurrent claim of the same row.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE work_units (
//!     id BIGSERIAL PRIMARY KEY,
//!     payload_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     state TEXT NOT NULL DEFAULT 'REA',
//!     num_unsatisfied_requirements INTEGER NOT NULL DEFAULT 0,
//!     creator_id BIGINT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     last_attempt_at TIMESTAMPTZ,
//!     succeeded_at TIMESTAMPTZ,
//!     leased_until TIMESTAMPTZ,
//!     lease_holder UUID,
//!     node TEXT NOT NULL DEFAULT '',
//!     description TEXT NOT NULL DEFAULT ''
//! );
//!
//! CREATE INDEX idx_work_units_claimable ON work_units (payload_type, id)
//!     WHERE state = 'REA';
//! CREATE INDEX idx_work_units_leased ON work_units (leased_until)
//!     WHERE state = 'LEA';
//!
//! CREATE TABLE work_unit_requirements (
//!     source_id BIGINT NOT NULL REFERENCES work_units (id),
//!     target_id BIGINT NOT NULL REFERENCES work_units (id),
//!     PRIMARY KEY (source_id, target_id)
//! );
//! CREATE INDEX idx_requirements_target ON work_unit_requirements (target_id);
//!
//! CREATE TABLE work_unit_state_count_deltas (
//!     id BIGSERIAL PRIMARY KEY,
//!     payload_type TEXT NOT NULL,
//!     from_state TEXT,
//!     to_state TEXT,
//!     delta BIGINT NOT NULL
//! );
//!
//! CREATE TABLE work_unit_state_counts (
//!     payload_type TEXT NOT NULL,
//!     state TEXT NOT NULL,
//!     shard INTEGER NOT NULL,
//!     count BIGINT NOT NULL DEFAULT 0,
//!     PRIMARY KEY (payload_type, state, shard)
//! );
//!
//! CREATE TABLE work_exceptions (
//!     id BIGSERIAL PRIMARY KEY,
//!     "timestamp" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     category TEXT NOT NULL,
//!     work_unit_id BIGINT NOT NULL REFERENCES work_units (id),
//!     message TEXT NOT NULL,
//!     stacktrace TEXT NOT NULL DEFAULT ''
//! );
//! ```
//!
//! Every query here is issued with `sqlx::query`/`query_as` against a live
//! connection rather than the `query!` macro family, deliberately — this
//! crate must build without a reachable database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;
use workflow_engine::{
    DispatchOutcome, ExceptionCategory, LeaseOutcome, NewWorkUnit, Store, StoreError, StoreResult,
    WorkException, WorkUnit, WorkUnitState,
};

const DEFAULT_SHARD_COUNT: i32 = 50;

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    shard_count: i32,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }

    pub fn with_shard_count(pool: PgPool, shard_count: i32) -> Self {
        Self { pool, shard_count }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(err: sqlx::Error) -> StoreError {
    if let Some(db_err) = err.as_database_error() {
        if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
            return StoreError::Retryable;
        }
    }
    StoreError::Backend(anyhow::Error::new(err))
}

fn row_to_work_unit(row: PgRow) -> StoreResult<WorkUnit> {
    let state_code: String = row.try_get("state").map_err(map_err)?;
    let state = WorkUnitState::from_code(&state_code).ok_or_else(|| {
        StoreError::Backend(anyhow::anyhow!("unrecognized work unit state code {state_code}"))
    })?;
    Ok(WorkUnit {
        id: row.try_get("id").map_err(map_err)?,
        payload_type: row.try_get("payload_type").map_err(map_err)?,
        payload: row.try_get("payload").map_err(map_err)?,
        state,
        num_unsatisfied_requirements: row.try_get("num_unsatisfied_requirements").map_err(map_err)?,
        creator_id: row.try_get("creator_id").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(map_err)?,
        succeeded_at: row.try_get("succeeded_at").map_err(map_err)?,
        leased_until: row.try_get("leased_until").map_err(map_err)?,
        lease_holder: row.try_get("lease_holder").map_err(map_err)?,
        node: row.try_get("node").map_err(map_err)?,
        description: row.try_get("description").map_err(map_err)?,
    })
}

async fn fetch_for_update(tx: &mut Transaction<'_, Postgres>, id: i64) -> StoreResult<WorkUnit> {
    let row = sqlx::query("SELECT * FROM work_units WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_err)?
        .ok_or(StoreError::NotFound { id })?;
    row_to_work_unit(row)
}

/// Reads a row inside a transaction without taking a row lock.
async fn fetch_tx(tx: &mut Transaction<'_, Postgres>, id: i64) -> StoreResult<Option<WorkUnit>> {
    let row = sqlx::query("SELECT * FROM work_units WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_err)?;
    row.map(row_to_work_unit).transpose()
}

fn assert_state(unit: &WorkUnit, expected: &[WorkUnitState]) -> StoreResult<()> {
    if expected.contains(&unit.state) {
        Ok(())
    } else {
        Err(StoreError::contract_violation(unit.id, expected, unit.state))
    }
}

async fn set_state(tx: &mut Transaction<'_, Postgres>, unit: &WorkUnit, to: WorkUnitState) -> StoreResult<()> {
    sqlx::query("UPDATE work_units SET state = $1 WHERE id = $2")
        .bind(to.code())
        .bind(unit.id)
        .execute(&mut **tx)
        .await
        .map_err(map_err)?;
    push_delta(tx, &unit.payload_type, Some(unit.state), Some(to), 1).await
}

async fn push_delta(
    tx: &mut Transaction<'_, Postgres>,
    payload_type: &str,
    from: Option<WorkUnitState>,
    to: Option<WorkUnitState>,
    delta: i64,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO work_unit_state_count_deltas (payload_type, from_state, to_state, delta) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(payload_type)
    .bind(from.map(|s| s.code()))
    .bind(to.map(|s| s.code()))
    .bind(delta)
    .execute(&mut **tx)
    .await
    .map_err(map_err)?;
    Ok(())
}

async fn insert_new(tx: &mut Transaction<'_, Postgres>, new: &NewWorkUnit) -> StoreResult<WorkUnit> {
    let row = sqlx::query(
        "INSERT INTO work_units (payload_type, payload, state, description) \
         VALUES ($1, $2, 'REA', $3) RETURNING *",
    )
    .bind(&new.payload_type)
    .bind(&new.payload)
    .bind(&new.description)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_err)?;
    row_to_work_unit(row)
}

async fn direct_requirers(tx: &mut Transaction<'_, Postgres>, target_id: i64) -> StoreResult<Vec<i64>> {
    let rows = sqlx::query(
        "SELECT source_id FROM work_unit_requirements WHERE target_id = $1 ORDER BY source_id",
    )
    .bind(target_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(map_err)?;
    rows.into_iter().map(|r| r.try_get("source_id").map_err(map_err)).collect()
}

/// §4.2.4 `requirement_satisfied`, applied against an already-open
/// transaction so it composes with the caller's own row locks.
async fn requirement_satisfied(
    tx: &mut Transaction<'_, Postgres>,
    requirer_id: i64,
    target_became_infeasible: bool,
    rerun_if_succeeded: bool,
) -> StoreResult<()> {
    let requirer = match fetch_for_update(tx, requirer_id).await {
        Ok(unit) => unit,
        Err(StoreError::NotFound { .. }) => return Ok(()),
        Err(err) => return Err(err),
    };

    match requirer.state {
        WorkUnitState::Pending => {
            let remaining = requirer.num_unsatisfied_requirements - 1;
            sqlx::query("UPDATE work_units SET num_unsatisfied_requirements = $1 WHERE id = $2")
                .bind(remaining)
                .bind(requirer_id)
                .execute(&mut **tx)
                .await
                .map_err(map_err)?;
            if target_became_infeasible {
                set_state(tx, &requirer, WorkUnitState::Infeasible).await?;
            } else if remaining <= 0 {
                let scheduled_future = requirer.scheduled_for_future(Utc::now());
                let to = if scheduled_future { WorkUnitState::Leased } else { WorkUnitState::Ready };
                set_state(tx, &requirer, to).await?;
            }
        }
        WorkUnitState::Succeeded => {
            if rerun_if_succeeded {
                rerun_tx(tx, requirer_id).await?;
            }
        }
        WorkUnitState::Leased => {
            let remaining = requirer.num_unsatisfied_requirements - 1;
            sqlx::query("UPDATE work_units SET num_unsatisfied_requirements = $1 WHERE id = $2")
                .bind(remaining)
                .bind(requirer_id)
                .execute(&mut **tx)
                .await
                .map_err(map_err)?;
        }
        WorkUnitState::Infeasible => {
            let actual = actual_unsatisfied_count(tx, requirer_id).await?;
            sqlx::query("UPDATE work_units SET num_unsatisfied_requirements = $1 WHERE id = $2")
                .bind(actual)
                .bind(requirer_id)
                .execute(&mut **tx)
                .await
                .map_err(map_err)?;
            if actual == 0 {
                set_state(tx, &requirer, WorkUnitState::Ready).await?;
            }
        }
        WorkUnitState::Ready => {}
    }
    Ok(())
}

async fn actual_unsatisfied_count(tx: &mut Transaction<'_, Postgres>, id: i64) -> StoreResult<i32> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM work_unit_requirements r \
         LEFT JOIN work_units t ON t.id = r.target_id \
         WHERE r.source_id = $1 AND (t.id IS NULL OR t.state != 'SUC')",
    )
    .bind(id)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_err)?;
    let n: i64 = row.try_get("n").map_err(map_err)?;
    Ok(n as i32)
}

async fn work_succeeded_tx(tx: &mut Transaction<'_, Postgres>, id: i64) -> StoreResult<()> {
    let unit = fetch_for_update(tx, id).await?;
    let succeeded_at = unit.last_attempt_at.unwrap_or_else(Utc::now);
    sqlx::query("UPDATE work_units SET succeeded_at = $1 WHERE id = $2")
        .bind(succeeded_at)
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(map_err)?;
    set_state(tx, &unit, WorkUnitState::Succeeded).await?;

    for requirer_id in direct_requirers(tx, id).await? {
        requirement_satisfied(tx, requirer_id, false, true).await?;
    }
    Ok(())
}

/// §4.2.9 `permanent_error`, walking the transitive-requirer closure with a
/// visited set (cycles are forbidden by contract, but the walk must not
/// loop forever if one somehow exists).
async fn permanent_error_tx(tx: &mut Transaction<'_, Postgres>, id: i64) -> StoreResult<()> {
    use std::collections::HashSet;

    let mut visited: HashSet<i64> = HashSet::new();
    let mut frontier = vec![id];
    while let Some(current) = frontier.pop() {
        for requirer in direct_requirers(tx, current).await? {
            if visited.insert(requirer) {
                frontier.push(requirer);
            }
        }
    }

    let mut ids: Vec<i64> = visited.into_iter().collect();
    ids.sort_unstable();

    for requirer_id in ids {
        let requirer = fetch_for_update(tx, requirer_id).await?;
        if requirer.state == WorkUnitState::Infeasible {
            continue;
        }
        assert_state(&requirer, &[WorkUnitState::Pending, WorkUnitState::Succeeded])?;
        set_state(tx, &requirer, WorkUnitState::Infeasible).await?;
    }

    let unit = fetch_for_update(tx, id).await?;
    set_state(tx, &unit, WorkUnitState::Infeasible).await?;
    Ok(())
}

async fn rerun_tx(tx: &mut Transaction<'_, Postgres>, id: i64) -> StoreResult<()> {
    for requirer_id in direct_requirers(tx, id).await? {
        let requirer = fetch_for_update(tx, requirer_id).await?;
        if requirer.state == WorkUnitState::Pending {
            sqlx::query("UPDATE work_units SET num_unsatisfied_requirements = num_unsatisfied_requirements + 1 WHERE id = $1")
                .bind(requirer_id)
                .execute(&mut **tx)
                .await
                .map_err(map_err)?;
        }
    }
    let unit = fetch_for_update(tx, id).await?;
    set_state(tx, &unit, WorkUnitState::Ready).await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn create(&self, new: NewWorkUnit) -> StoreResult<WorkUnit> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = insert_new(&mut tx, &new).await?;
        push_delta(&mut tx, &new.payload_type, None, Some(WorkUnitState::Ready), 1).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(unit)
    }

    async fn bulk_create(&self, news: Vec<NewWorkUnit>) -> StoreResult<Vec<WorkUnit>> {
        if news.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut created = Vec::with_capacity(news.len());
        let mut counts: HashMap<String, i64> = HashMap::new();
        for new in &news {
            *counts.entry(new.payload_type.clone()).or_insert(0) += 1;
            created.push(insert_new(&mut tx, new).await?);
        }
        for (payload_type, count) in counts {
            push_delta(&mut tx, &payload_type, None, Some(WorkUnitState::Ready), count).await?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(created)
    }

    async fn fetch(&self, id: i64) -> StoreResult<WorkUnit> {
        let row = sqlx::query("SELECT * FROM work_units WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or(StoreError::NotFound { id })?;
        row_to_work_unit(row)
    }

    async fn get_by_state(&self, payload_type: &str, state: WorkUnitState) -> StoreResult<Vec<WorkUnit>> {
        let rows = sqlx::query("SELECT * FROM work_units WHERE payload_type = $1 AND state = $2 ORDER BY id")
            .bind(payload_type)
            .bind(state.code())
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.into_iter().map(row_to_work_unit).collect()
    }

    async fn add_requirement(&self, source_id: i64, target_id: i64) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // `A` is only ever read, never locked, by this algorithm — the
        // ascending-id lock-ordering rule applies to `B` alone.
        let source = fetch_tx(&mut tx, source_id).await?.ok_or(StoreError::NotFound { id: source_id })?;
        assert_state(&source, &[WorkUnitState::Pending, WorkUnitState::Ready, WorkUnitState::Leased])?;

        let inserted = sqlx::query(
            "INSERT INTO work_unit_requirements (source_id, target_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING RETURNING source_id",
        )
        .bind(source_id)
        .bind(target_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;
        if inserted.is_none() {
            tx.commit().await.map_err(map_err)?;
            return Ok(false);
        }

        // Cheap unlocked peek first: if `B` is already `Succeeded` there is
        // nothing to do and no lock need ever be taken on it.
        let Some(unlocked_target) = fetch_tx(&mut tx, target_id).await? else {
            tx.commit().await.map_err(map_err)?;
            return Ok(true);
        };
        if unlocked_target.state == WorkUnitState::Succeeded {
            tx.commit().await.map_err(map_err)?;
            return Ok(true);
        }

        // Not (yet) known to be done: lock `B` for real and recheck.
        let target = fetch_for_update(&mut tx, target_id).await?;
        if target.state == WorkUnitState::Succeeded {
            tx.commit().await.map_err(map_err)?;
            return Ok(true);
        }

        sqlx::query("UPDATE work_units SET num_unsatisfied_requirements = num_unsatisfied_requirements + 1 WHERE id = $1")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        if target.state == WorkUnitState::Infeasible {
            set_state(&mut tx, &source, WorkUnitState::Infeasible).await?;
        } else if source.state != WorkUnitState::Pending {
            set_state(&mut tx, &source, WorkUnitState::Pending).await?;
        }

        tx.commit().await.map_err(map_err)?;
        Ok(true)
    }

    async fn create_requirements(&self, source_id: i64, targets: Vec<NewWorkUnit>) -> StoreResult<Vec<WorkUnit>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let source = fetch_for_update(&mut tx, source_id).await?;
        assert_state(&source, &[WorkUnitState::Pending, WorkUnitState::Ready, WorkUnitState::Leased])?;

        let mut counts: HashMap<String, i64> = HashMap::new();
        let mut created = Vec::with_capacity(targets.len());
        for new in &targets {
            *counts.entry(new.payload_type.clone()).or_insert(0) += 1;
            let unit = insert_new(&mut tx, new).await?;
            sqlx::query("INSERT INTO work_unit_requirements (source_id, target_id) VALUES ($1, $2)")
                .bind(source_id)
                .bind(unit.id)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            created.push(unit);
        }
        for (payload_type, count) in counts {
            push_delta(&mut tx, &payload_type, None, Some(WorkUnitState::Ready), count).await?;
        }

        sqlx::query("UPDATE work_units SET num_unsatisfied_requirements = num_unsatisfied_requirements + $1 WHERE id = $2")
            .bind(created.len() as i32)
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        if source.state == WorkUnitState::Ready {
            set_state(&mut tx, &source, WorkUnitState::Pending).await?;
        }

        tx.commit().await.map_err(map_err)?;
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
        let leased_until = now + ttl;
        let rows = sqlx::query(
            "WITH claimable AS ( \
                 SELECT id FROM work_units \
                 WHERE payload_type = $1 AND state = 'REA' AND (leased_until IS NULL OR leased_until <= $2) \
                 ORDER BY id LIMIT $3 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE work_units SET state = 'LEA', lease_holder = gen_random_uuid(), \
                 leased_until = $4, last_attempt_at = $2, node = $5 \
             WHERE id IN (SELECT id FROM claimable) RETURNING *",
        )
        .bind(payload_type)
        .bind(now)
        .bind(limit)
        .bind(leased_until)
        .bind(node)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let units: Vec<WorkUnit> = rows.into_iter().map(row_to_work_unit).collect::<StoreResult<_>>()?;
        if !units.is_empty() {
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            push_delta(&mut tx, payload_type, Some(WorkUnitState::Ready), Some(WorkUnitState::Leased), units.len() as i64).await?;
            tx.commit().await.map_err(map_err)?;
        }
        Ok(units)
    }

    async fn take_lease(&self, id: i64, node: &str, now: DateTime<Utc>, ttl: Duration) -> StoreResult<WorkUnit> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        assert_state(&unit, &[WorkUnitState::Ready])?;

        sqlx::query(
            "UPDATE work_units SET lease_holder = gen_random_uuid(), leased_until = $1, \
             last_attempt_at = $2, node = $3 WHERE id = $4",
        )
        .bind(now + ttl)
        .bind(now)
        .bind(node)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        set_state(&mut tx, &unit, WorkUnitState::Leased).await?;

        let leased = fetch_for_update(&mut tx, id).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(leased)
    }

    async fn revoke_lease(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        assert_state(&unit, &[WorkUnitState::Leased])?;
        let new_state = if unit.num_unsatisfied_requirements == 0 { WorkUnitState::Ready } else { WorkUnitState::Pending };
        set_state(&mut tx, &unit, new_state).await?;
        let result = fetch_for_update(&mut tx, id).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(result)
    }

    async fn apply_outcome_if_leased(&self, id: i64, expected_holder: Uuid, outcome: DispatchOutcome) -> StoreResult<LeaseOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        if unit.state != WorkUnitState::Leased || unit.lease_holder != Some(expected_holder) {
            tx.commit().await.map_err(map_err)?;
            return Ok(LeaseOutcome::StaleLease);
        }

        match outcome {
            DispatchOutcome::Succeeded => work_succeeded_tx(&mut tx, id).await?,
            DispatchOutcome::Infeasible => permanent_error_tx(&mut tx, id).await?,
            DispatchOutcome::Reschedule(until) => {
                sqlx::query("UPDATE work_units SET leased_until = $1 WHERE id = $2")
                    .bind(until)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_err)?;
            }
        }
        tx.commit().await.map_err(map_err)?;
        Ok(LeaseOutcome::Applied)
    }

    async fn work_succeeded(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        assert_state(&unit, &[WorkUnitState::Leased])?;
        work_succeeded_tx(&mut tx, id).await?;
        let result = fetch_for_update(&mut tx, id).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(result)
    }

    async fn permanent_error(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        assert_state(&unit, &[WorkUnitState::Leased])?;
        permanent_error_tx(&mut tx, id).await?;
        let result = fetch_for_update(&mut tx, id).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(result)
    }

    async fn rerun(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        assert_state(&unit, &[WorkUnitState::Succeeded])?;
        rerun_tx(&mut tx, id).await?;
        let result = fetch_for_update(&mut tx, id).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(result)
    }

    async fn rerun_all(&self, payload_type: &str, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let pending: i64 = sqlx::query("SELECT COUNT(*) AS n FROM work_units WHERE payload_type = $1 AND state = 'PEN'")
            .bind(payload_type)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?
            .try_get("n")
            .map_err(map_err)?;
        if pending > 0 {
            return Err(StoreError::PendingWorkOutstanding { operation: "rerun_all", count: pending });
        }

        let rows = sqlx::query(
            "SELECT id FROM work_units WHERE payload_type = $1 AND state = 'SUC' \
             AND ($2::timestamptz IS NULL OR created_at >= $2) \
             AND ($3::timestamptz IS NULL OR created_at <= $3) ORDER BY id",
        )
        .bind(payload_type)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        let mut count = 0i64;
        for row in rows {
            let id: i64 = row.try_get("id").map_err(map_err)?;
            rerun_tx(&mut tx, id).await?;
            count += 1;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(count)
    }

    async fn mark_as_feasible(&self, id: i64) -> StoreResult<WorkUnit> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        assert_state(&unit, &[WorkUnitState::Infeasible])?;
        let new_state = if unit.num_unsatisfied_requirements == 0 { WorkUnitState::Ready } else { WorkUnitState::Pending };
        set_state(&mut tx, &unit, new_state).await?;
        let result = fetch_for_update(&mut tx, id).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(result)
    }

    async fn mark_all_as_feasible(&self, payload_type: &str) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("LOCK TABLE work_units IN EXCLUSIVE MODE").execute(&mut *tx).await.map_err(map_err)?;

        let rows = sqlx::query(
            "UPDATE work_units SET state = 'REA' \
             WHERE payload_type = $1 AND state = 'INF' AND num_unsatisfied_requirements = 0 \
             RETURNING id",
        )
        .bind(payload_type)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        if !rows.is_empty() {
            push_delta(&mut tx, payload_type, Some(WorkUnitState::Infeasible), Some(WorkUnitState::Ready), rows.len() as i64).await?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(rows.len() as i64)
    }

    async fn check_num_unsatisfied_requirements(&self, id: i64) -> StoreResult<Option<i32>> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let unit = fetch_for_update(&mut tx, id).await?;
        assert_state(&unit, &[WorkUnitState::Pending, WorkUnitState::Infeasible])?;
        let actual = actual_unsatisfied_count(&mut tx, id).await?;
        if actual == unit.num_unsatisfied_requirements {
            tx.commit().await.map_err(map_err)?;
            return Ok(None);
        }

        sqlx::query("UPDATE work_units SET num_unsatisfied_requirements = $1 WHERE id = $2")
            .bind(actual)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        if actual == 0 && unit.state == WorkUnitState::Pending {
            set_state(&mut tx, &unit, WorkUnitState::Ready).await?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(Some(actual))
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let candidates = sqlx::query(
            "SELECT id FROM work_units WHERE state = 'LEA' AND leased_until <= $1 ORDER BY id FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        let mut reaped = 0u64;
        for row in candidates {
            let id: i64 = row.try_get("id").map_err(map_err)?;
            let unit = fetch_for_update(&mut tx, id).await?;
            let new_state = if unit.num_unsatisfied_requirements == 0 { WorkUnitState::Ready } else { WorkUnitState::Pending };
            set_state(&mut tx, &unit, new_state).await?;
            reaped += 1;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(reaped)
    }

    async fn log_exception(&self, work_unit_id: i64, category: ExceptionCategory, message: &str, stacktrace: &str) -> StoreResult<WorkException> {
        let row = sqlx::query(
            "INSERT INTO work_exceptions (category, work_unit_id, message, stacktrace) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(category.as_str())
        .bind(work_unit_id)
        .bind(message)
        .bind(stacktrace)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(WorkException {
            id: row.try_get("id").map_err(map_err)?,
            timestamp: row.try_get("timestamp").map_err(map_err)?,
            category,
            work_unit_id: row.try_get("work_unit_id").map_err(map_err)?,
            message: row.try_get("message").map_err(map_err)?,
            stacktrace: row.try_get("stacktrace").map_err(map_err)?,
        })
    }

    async fn apply_counter_deltas(&self, limit: i64) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let rows = sqlx::query(
            "SELECT id, payload_type, from_state, to_state, delta FROM work_unit_state_count_deltas \
             ORDER BY id LIMIT $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;
        if rows.is_empty() {
            tx.commit().await.map_err(map_err)?;
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut aggregate: HashMap<(String, String), i64> = HashMap::new();
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(map_err)?;
            ids.push(id);
            let payload_type: String = row.try_get("payload_type").map_err(map_err)?;
            let from_state: Option<String> = row.try_get("from_state").map_err(map_err)?;
            let to_state: Option<String> = row.try_get("to_state").map_err(map_err)?;
            let delta: i64 = row.try_get("delta").map_err(map_err)?;
            if let Some(from) = from_state {
                *aggregate.entry((payload_type.clone(), from)).or_insert(0) -= delta;
            }
            if let Some(to) = to_state {
                *aggregate.entry((payload_type, to)).or_insert(0) += delta;
            }
        }

        let mut keys: Vec<(String, String)> = aggregate.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let delta = aggregate[&key];
            let shard = fastrand::i32(0..self.shard_count.max(1));
            sqlx::query(
                "INSERT INTO work_unit_state_counts (payload_type, state, shard, count) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (payload_type, state, shard) \
                 DO UPDATE SET count = work_unit_state_counts.count + EXCLUDED.count",
            )
            .bind(&key.0)
            .bind(&key.1)
            .bind(shard)
            .bind(delta)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }

        sqlx::query("DELETE FROM work_unit_state_count_deltas WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(ids.len() as u64)
    }

    async fn counts_by_type_and_state(&self) -> StoreResult<HashMap<(String, WorkUnitState), i64>> {
        let rows = sqlx::query(
            "SELECT payload_type, state, SUM(count)::BIGINT AS total FROM work_unit_state_counts GROUP BY payload_type, state",
        )
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;

        let mut totals = HashMap::new();
        for row in rows {
            let payload_type: String = row.try_get("payload_type").map_err(map_err)?;
            let state_code: String = row.try_get("state").map_err(map_err)?;
            let total: i64 = row.try_get("total").map_err(map_err)?;
            if let Some(state) = WorkUnitState::from_code(&state_code) {
                totals.insert((payload_type, state), total);
            }
        }
        Ok(totals)
    }

    async fn recompute_counts(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("LOCK TABLE work_unit_state_count_deltas IN EXCLUSIVE MODE").execute(&mut *tx).await.map_err(map_err)?;

        let outstanding: i64 = sqlx::query("SELECT COUNT(*) AS n FROM work_unit_state_count_deltas")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?
            .try_get("n")
            .map_err(map_err)?;
        if outstanding > 0 {
            return Err(StoreError::DeltasOutstanding { count: outstanding });
        }

        sqlx::query("LOCK TABLE work_units IN EXCLUSIVE MODE").execute(&mut *tx).await.map_err(map_err)?;
        sqlx::query("DELETE FROM work_unit_state_counts").execute(&mut *tx).await.map_err(map_err)?;
        sqlx::query(
            "INSERT INTO work_unit_state_counts (payload_type, state, shard, count) \
             SELECT payload_type, state, 0, COUNT(*) FROM work_units GROUP BY payload_type, state",
        )
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(())
    }
}
