//! Integration tests against a real Postgres instance.
//!
//! Skipped unless `DATABASE_URL` is set, matching the convention used
//! elsewhere in the corpus for tests that need a live database.

use std::str::FromStr;

use chrono::{Duration, Utc};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use workflow_engine::{NewWorkUnit, Store, WorkUnitState};
use workflow_engine_postgres::PgStore;

const SCHEMA_SQL: &str = r#"
CREATE TABLE work_units (
    id BIGSERIAL PRIMARY KEY,
    payload_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    state TEXT NOT NULL DEFAULT 'REA',
    num_unsatisfied_requirements INTEGER NOT NULL DEFAULT 0,
    creator_id BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_attempt_at TIMESTAMPTZ,
    succeeded_at TIMESTAMPTZ,
    leased_until TIMESTAMPTZ,
    lease_holder UUID,
    node TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT ''
);
CREATE INDEX idx_work_units_claimable ON work_units (payload_type, id) WHERE state = 'REA';
CREATE INDEX idx_work_units_leased ON work_units (leased_until) WHERE state = 'LEA';

CREATE TABLE work_unit_requirements (
    source_id BIGINT NOT NULL REFERENCES work_units (id),
    target_id BIGINT NOT NULL REFERENCES work_units (id),
    PRIMARY KEY (source_id, target_id)
);
CREATE INDEX idx_requirements_target ON work_unit_requirements (target_id);

CREATE TABLE work_unit_state_count_deltas (
    id BIGSERIAL PRIMARY KEY,
    payload_type TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT,
    delta BIGINT NOT NULL
);

CREATE TABLE work_unit_state_counts (
    payload_type TEXT NOT NULL,
    state TEXT NOT NULL,
    shard INTEGER NOT NULL,
    count BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (payload_type, state, shard)
);

CREATE TABLE work_exceptions (
    id BIGSERIAL PRIMARY KEY,
    "timestamp" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    category TEXT NOT NULL,
    work_unit_id BIGINT NOT NULL REFERENCES work_units (id),
    message TEXT NOT NULL,
    stacktrace TEXT NOT NULL DEFAULT ''
);
"#;

/// Connects to `DATABASE_URL`, creates a fresh, randomly-named schema for
/// this test run, and returns a pool whose search_path is pinned to it.
/// `None` if `DATABASE_URL` isn't set, in which case the caller should skip.
async fn test_pool(test_name: &str) -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let bootstrap = PgPool::connect(&url).await.expect("connect to DATABASE_URL");
    let schema = format!("workflow_engine_test_{test_name}");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&bootstrap)
        .await
        .unwrap();
    sqlx::query(&format!("CREATE SCHEMA {schema}")).execute(&bootstrap).await.unwrap();
    bootstrap.close().await;

    // Pin every pooled connection's search_path to the fresh schema, since a
    // session-level `SET search_path` on one connection wouldn't follow the
    // connection back into the pool's rotation.
    let options = PgConnectOptions::from_str(&url).unwrap().options([("search_path", schema.as_str())]);
    let pool = PgPool::connect_with(options).await.expect("connect with search_path");
    for stmt in SCHEMA_SQL.split(";\n\n").map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::raw_sql(stmt).execute(&pool).await.unwrap();
    }
    Some(pool)
}

fn new_unit(payload_type: &str) -> NewWorkUnit {
    NewWorkUnit {
        payload_type: payload_type.to_string(),
        payload: serde_json::json!({}),
        description: format!("{payload_type} work"),
        search_terms: Vec::new(),
        creator_id: None,
    }
}

#[tokio::test]
async fn scenario_simple_success_against_postgres() {
    let Some(pool) = test_pool("simple_success").await else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let store = PgStore::new(pool);

    let unit = store.create(new_unit("noop")).await.unwrap();
    assert_eq!(unit.state, WorkUnitState::Ready);

    let now = Utc::now();
    let leased = store.claim_ready("noop", 10, "node-a", now, Duration::seconds(30)).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].state, WorkUnitState::Leased);

    let unit = store.work_succeeded(leased[0].id).await.unwrap();
    assert_eq!(unit.state, WorkUnitState::Succeeded);
}

#[tokio::test]
async fn scenario_chained_dependency_against_postgres() {
    let Some(pool) = test_pool("chained_dependency").await else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let store = PgStore::new(pool);

    let target = store.create(new_unit("build")).await.unwrap();
    let source = store.create(new_unit("deploy")).await.unwrap();
    store.add_requirement(source.id, target.id).await.unwrap();

    let source = store.fetch(source.id).await.unwrap();
    assert_eq!(source.state, WorkUnitState::Pending);
    assert_eq!(source.num_unsatisfied_requirements, 1);

    let now = Utc::now();
    let leased = store.claim_ready("build", 10, "node-a", now, Duration::seconds(30)).await.unwrap();
    store.work_succeeded(leased[0].id).await.unwrap();

    let source = store.fetch(source.id).await.unwrap();
    assert_eq!(source.state, WorkUnitState::Ready);
    assert_eq!(source.num_unsatisfied_requirements, 0);
}

#[tokio::test]
async fn concurrent_claims_never_double_assign_against_postgres() {
    let Some(pool) = test_pool("concurrent_claims").await else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let store = std::sync::Arc::new(PgStore::new(pool));

    for _ in 0..20 {
        store.create(new_unit("batch")).await.unwrap();
    }

    let now = Utc::now();
    let store_a = store.clone();
    let store_b = store.clone();
    let (a, b) = tokio::join!(
        async move { store_a.claim_ready("batch", 10, "node-a", now, Duration::seconds(30)).await },
        async move { store_b.claim_ready("batch", 10, "node-b", now, Duration::seconds(30)).await },
    );
    let a = a.unwrap();
    let b = b.unwrap();
    let claimed_ids: std::collections::HashSet<_> = a.iter().chain(b.iter()).map(|u| u.id).collect();
    assert_eq!(claimed_ids.len(), a.len() + b.len(), "no work unit may be claimed by both batches");
    assert_eq!(claimed_ids.len(), 20);
}

#[tokio::test]
async fn recompute_counts_matches_incremental_deltas_against_postgres() {
    let Some(pool) = test_pool("recompute_matches").await else {
        eprintln!("skip (no DATABASE_URL)");
        return;
    };
    let store = PgStore::new(pool);

    for _ in 0..5 {
        store.create(new_unit("flaky")).await.unwrap();
    }
    while Store::apply_counter_deltas(&store, 100).await.unwrap() > 0 {}
    let incremental = store.counts_by_type_and_state().await.unwrap();

    store.recompute_counts().await.unwrap();
    let recomputed = store.counts_by_type_and_state().await.unwrap();

    assert_eq!(
        incremental.get(&("flaky".to_string(), WorkUnitState::Ready)),
        recomputed.get(&("flaky".to_string(), WorkUnitState::Ready))
    );
}
