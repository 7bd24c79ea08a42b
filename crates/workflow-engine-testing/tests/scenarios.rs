//! End-to-end scenarios and invariant checks against [`InMemoryStore`],
//! exercised through the same `Store` trait a real deployment uses.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;
use workflow_engine_testing::InMemoryStore;

use workflow_engine::StoreError;
use workflow_engine::{ExceptionCategory, NewWorkUnit, WorkUnitState};
use workflow_engine::{DispatchOutcome, LeaseOutcome, Store};

fn new_unit(payload_type: &str) -> NewWorkUnit {
    NewWorkUnit {
        payload_type: payload_type.to_string(),
        payload: serde_json::json!({}),
        description: format!("{payload_type} work"),
        search_terms: Vec::new(),
        creator_id: None,
    }
}

/// I1/I2: a non-`Infeasible` unit's state and `num_unsatisfied_requirements`
/// always agree.
fn assert_i1_i2(unit: &workflow_engine::WorkUnit) {
    match unit.state {
        WorkUnitState::Pending => assert!(unit.num_unsatisfied_requirements > 0),
        WorkUnitState::Ready | WorkUnitState::Leased | WorkUnitState::Succeeded => {
            assert_eq!(unit.num_unsatisfied_requirements, 0)
        }
        WorkUnitState::Infeasible => {}
    }
}

#[tokio::test]
async fn scenario_simple_success() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let unit = store.create(new_unit("noop")).await.unwrap();
    assert_eq!(unit.state, WorkUnitState::Ready);

    let now = Utc::now();
    let leased = store
        .claim_ready("noop", 10, "node-a", now, Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    let leased = &leased[0];
    assert_eq!(leased.state, WorkUnitState::Leased);
    assert!(leased.lease_holder.is_some());

    let outcome = store
        .apply_outcome_if_leased(leased.id, leased.lease_holder.unwrap(), DispatchOutcome::Succeeded)
        .await
        .unwrap();
    assert_eq!(outcome, LeaseOutcome::Applied);

    let unit = store.fetch(unit.id).await.unwrap();
    assert_eq!(unit.state, WorkUnitState::Succeeded);
    assert_i1_i2(&unit);
}

#[tokio::test]
async fn scenario_chained_dependency() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let target = store.create(new_unit("build")).await.unwrap();
    let source = store.create(new_unit("deploy")).await.unwrap();

    store.add_requirement(source.id, target.id).await.unwrap();
    let source = store.fetch(source.id).await.unwrap();
    assert_eq!(source.state, WorkUnitState::Pending);
    assert_eq!(source.num_unsatisfied_requirements, 1);

    // the target must not be claimable until requirements are resolved, so
    // only the target is Ready at this point.
    let ready = store.get_by_state("deploy", WorkUnitState::Ready).await.unwrap();
    assert!(ready.is_empty());

    let now = Utc::now();
    let leased = store
        .claim_ready("build", 10, "node-a", now, Duration::seconds(30))
        .await
        .unwrap();
    store
        .apply_outcome_if_leased(leased[0].id, leased[0].lease_holder.unwrap(), DispatchOutcome::Succeeded)
        .await
        .unwrap();

    let source = store.fetch(source.id).await.unwrap();
    assert_eq!(source.state, WorkUnitState::Ready);
    assert_eq!(source.num_unsatisfied_requirements, 0);
    assert_i1_i2(&source);
}

#[tokio::test]
async fn scenario_permanent_error_propagation_and_recovery() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let target = store.create(new_unit("fetch")).await.unwrap();
    let mid = store.create(new_unit("transform")).await.unwrap();
    let top = store.create(new_unit("publish")).await.unwrap();

    store.add_requirement(mid.id, target.id).await.unwrap();
    store.add_requirement(top.id, mid.id).await.unwrap();

    let now = Utc::now();
    let leased = store
        .claim_ready("fetch", 10, "node-a", now, Duration::seconds(30))
        .await
        .unwrap();
    store
        .apply_outcome_if_leased(leased[0].id, leased[0].lease_holder.unwrap(), DispatchOutcome::Infeasible)
        .await
        .unwrap();

    let target = store.fetch(target.id).await.unwrap();
    let mid = store.fetch(mid.id).await.unwrap();
    let top = store.fetch(top.id).await.unwrap();
    assert_eq!(target.state, WorkUnitState::Infeasible);
    assert_eq!(mid.state, WorkUnitState::Infeasible, "I6: transitive requirer of an Infeasible unit must itself be Infeasible");
    assert_eq!(top.state, WorkUnitState::Infeasible, "I6: propagation closure must reach every transitive requirer");

    // recovery: marking all infeasible "fetch" units feasible again.
    let flipped = store.mark_all_as_feasible("fetch").await.unwrap();
    assert_eq!(flipped, 1);
    let target = store.fetch(target.id).await.unwrap();
    assert_eq!(target.state, WorkUnitState::Ready);

    // mid/top still Infeasible: mark_all_as_feasible is scoped to one type.
    let mid = store.mark_as_feasible(mid.id).await.unwrap();
    assert_eq!(mid.state, WorkUnitState::Pending, "mid still has an unsatisfied requirement on target");
    let top = store.mark_as_feasible(top.id).await.unwrap();
    assert_eq!(top.state, WorkUnitState::Pending);
}

#[tokio::test]
async fn scenario_rerun_preincrements_pending_requirer() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let target = store.create(new_unit("ingest")).await.unwrap();
    let source = store.create(new_unit("report")).await.unwrap();
    store.add_requirement(source.id, target.id).await.unwrap();

    let now = Utc::now();
    let leased = store
        .claim_ready("ingest", 10, "node-a", now, Duration::seconds(30))
        .await
        .unwrap();
    store
        .apply_outcome_if_leased(leased[0].id, leased[0].lease_holder.unwrap(), DispatchOutcome::Succeeded)
        .await
        .unwrap();

    // source is now Ready with 0 unsatisfied requirements. Put it back to
    // Pending by adding a second, still-open requirement, then rerun the
    // already-succeeded target and confirm the requirer's counter is
    // pre-incremented rather than left to race to zero.
    let second_target = store.create(new_unit("ingest")).await.unwrap();
    store.add_requirement(source.id, second_target.id).await.unwrap();
    let source = store.fetch(source.id).await.unwrap();
    assert_eq!(source.state, WorkUnitState::Pending);
    assert_eq!(source.num_unsatisfied_requirements, 1);

    store.rerun(target.id).await.unwrap();
    let source = store.fetch(source.id).await.unwrap();
    assert_eq!(
        source.num_unsatisfied_requirements, 2,
        "rerunning target must re-add its edge to source's outstanding count"
    );
    assert_eq!(source.state, WorkUnitState::Pending);
}

#[tokio::test]
async fn scenario_lease_expiry_reaping_allows_re_execution() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let unit = store.create(new_unit("noop")).await.unwrap();
    let now = Utc::now();
    let leased = store
        .claim_ready("noop", 10, "node-a", now, Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);

    let later = now + Duration::seconds(2);
    let reaped = store.reap_expired_leases(later).await.unwrap();
    assert_eq!(reaped, 1);

    let unit = store.fetch(unit.id).await.unwrap();
    assert_eq!(unit.state, WorkUnitState::Ready, "expired lease must return the unit to Ready as if never leased");

    // at-least-once: the unit can be claimed again by a second worker.
    let leased_again = store
        .claim_ready("noop", 10, "node-b", later, Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(leased_again.len(), 1);
    assert_ne!(leased_again[0].lease_holder, leased[0].lease_holder);
}

#[tokio::test]
async fn scenario_concurrent_add_requirement_retries_transparently() {
    let store = InMemoryStore::new();
    store.fail_next_add_requirement(2);

    let target = store.create(new_unit("shared")).await.unwrap();
    let a = store.create(new_unit("consumer")).await.unwrap();

    let result = workflow_engine::retry_on_conflict(|| store.add_requirement(a.id, target.id)).await;
    assert!(result.is_ok(), "transient conflicts must be transparently retried");

    let a = store.fetch(a.id).await.unwrap();
    assert_eq!(a.state, WorkUnitState::Pending);
    assert_eq!(a.num_unsatisfied_requirements, 1);
}

#[tokio::test]
async fn boundary_add_requirement_on_already_succeeded_target_is_a_noop() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let target = store.create(new_unit("ingest")).await.unwrap();
    let now = Utc::now();
    let leased = store.claim_ready("ingest", 10, "n", now, Duration::seconds(30)).await.unwrap();
    store
        .apply_outcome_if_leased(leased[0].id, leased[0].lease_holder.unwrap(), DispatchOutcome::Succeeded)
        .await
        .unwrap();

    let source = store.create(new_unit("report")).await.unwrap();
    store.add_requirement(source.id, target.id).await.unwrap();

    let source = store.fetch(source.id).await.unwrap();
    assert_eq!(source.state, WorkUnitState::Ready, "requiring an already-Succeeded unit must not move the requirer to Pending");
    assert_eq!(source.num_unsatisfied_requirements, 0);
}

#[tokio::test]
async fn boundary_success_with_no_requirers_is_a_legal_noop() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let unit = store.create(new_unit("noop")).await.unwrap();
    let unit = store.work_succeeded(unit.id).await;
    // work_succeeded asserts Leased; a freshly-created Ready unit can't call
    // it directly, so take a lease first to exercise the no-requirers path.
    assert!(matches!(unit, Err(StoreError::ContractViolation { .. })));

    let now = Utc::now();
    let leased = store.claim_ready("noop", 10, "n", now, Duration::seconds(30)).await.unwrap();
    let unit = store.work_succeeded(leased[0].id).await.unwrap();
    assert_eq!(unit.state, WorkUnitState::Succeeded);
}

#[tokio::test]
async fn idempotence_mark_all_feasible_then_recompute_matches_either_order() {
    let store = InMemoryStore::new();

    let target = store.create(new_unit("flaky")).await.unwrap();
    let now = Utc::now();
    let leased = store.claim_ready("flaky", 10, "n", now, Duration::seconds(30)).await.unwrap();
    store
        .apply_outcome_if_leased(leased[0].id, leased[0].lease_holder.unwrap(), DispatchOutcome::Infeasible)
        .await
        .unwrap();

    store.mark_all_as_feasible("flaky").await.unwrap();
    while store.pending_delta_count() > 0 {
        Store::apply_counter_deltas(&store, 100).await.unwrap();
    }
    let counts_a = store.counts_by_type_and_state().await.unwrap();

    store.recompute_counts().await.unwrap();
    let counts_b = store.counts_by_type_and_state().await.unwrap();

    assert_eq!(counts_a.get(&("flaky".to_string(), WorkUnitState::Ready)), counts_b.get(&("flaky".to_string(), WorkUnitState::Ready)));

    let _ = target;
}

#[tokio::test]
async fn exception_log_records_failures_with_tab_separated_frames() {
    use workflow_engine::WorkException;

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let unit = store.create(new_unit("flaky")).await.unwrap();

    let frames = vec!["frame_one".to_string(), "frame_two".to_string()];
    let stacktrace = WorkException::join_frames(&frames);
    let logged = store
        .log_exception(unit.id, ExceptionCategory::Transient, "boom", &stacktrace)
        .await
        .unwrap();

    assert_eq!(logged.frames(), vec!["frame_one", "frame_two"]);
    let _ = Uuid::new_v4();
}
