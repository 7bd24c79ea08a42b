//! # workflow-engine
//!
//! A durable, transactional dispatcher that schedules units of work across a
//! pool of workers, tracks their dependencies as a directed acyclic graph,
//! enforces leases and retries, and maintains sharded statistical counters
//! consistent with the DAG state under concurrent mutation.
//!
//! ## Core concepts
//!
//! - [`WorkUnit`] = the durable scheduling record: state, lease, and a
//!   denormalized count of unsatisfied requirements.
//! - [`Payload`] = the typed job description attached 1:1 to a work unit.
//! - [`Handler`] = the payload type's executable behavior.
//! - [`Store`] = the durable, transactional backend (see `workflow-engine-postgres`
//!   for the production implementation, `workflow-engine-testing` for an
//!   in-memory one).
//! - [`Dispatcher`] = the executor loop that claims `Ready` work, runs
//!   handlers, and applies their outcomes.
//!
//! ## Key invariants
//!
//! 1. **One state-machine operation = one transaction.** Every [`Store`]
//!    method that mutates state commits or rolls back as a unit.
//! 2. **Row locks are always taken in ascending id order.** This is the
//!    single rule that keeps deadlocks recoverable instead of catastrophic.
//! 3. **Deadlocks are expected, not eliminated.** [`StoreError::Retryable`]
//!    exists so the dispatcher (via [`retry_on_conflict`]) can simply redo
//!    the operation.
//! 4. **Work is at-least-once.** Lease expiry can hand a unit to a second
//!    worker; handlers must be idempotent.
//!
//! See `SPEC_FULL.md` and `DESIGN.md` for the full design and the rationale
//! behind the choices made while building this out.

mod admin;
mod dispatcher;
mod error;
mod handler;
mod model;
mod payload;
mod store;

pub use admin::{
    check_unsatisfied_requirements, counts_by_type_and_state, mark_all_as_feasible, recompute_counts,
    rerun, rerun_all,
};
pub use dispatcher::{retry_on_conflict, Dispatcher, DispatcherBuilder, DispatcherConfig, DispatcherHandle};
pub use error::{StoreError, StoreResult};
pub use handler::{CommandRegistry, FailureClass, Handler, Outcome};
pub use model::{
    ExceptionCategory, NewWorkUnit, RequirementEdge, StateCountDelta, StateCountKey, WorkException,
    WorkUnit, WorkUnitState, WorkUnitStateOrd,
};
pub use payload::Payload;
pub use store::{DispatchOutcome, LeaseOutcome, Store};

pub use async_trait::async_trait;
