//! The work-unit record and its satellite types.
//!
//! These are storage-engine agnostic: [`crate::store::Store`] implementations
//! translate to and from whatever the backing database actually persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The state of a work unit. Stored as the short codes below (`PEN`, `REA`,
/// ...), matching the three-letter codes the scheduling model has always
/// used, so that a DBA reading the raw table sees the same vocabulary as the
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkUnitState {
    Pending,
    Ready,
    Leased,
    Succeeded,
    Infeasible,
}

impl WorkUnitState {
    pub const ALL: [WorkUnitState; 5] = [
        WorkUnitState::Pending,
        WorkUnitState::Ready,
        WorkUnitState::Leased,
        WorkUnitState::Succeeded,
        WorkUnitState::Infeasible,
    ];

    pub fn code(self) -> &'static str {
        match self {
            WorkUnitState::Pending => "PEN",
            WorkUnitState::Ready => "REA",
            WorkUnitState::Leased => "LEA",
            WorkUnitState::Succeeded => "SUC",
            WorkUnitState::Infeasible => "INF",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "PEN" => WorkUnitState::Pending,
            "REA" => WorkUnitState::Ready,
            "LEA" => WorkUnitState::Leased,
            "SUC" => WorkUnitState::Succeeded,
            "INF" => WorkUnitState::Infeasible,
            _ => return None,
        })
    }
}

impl std::fmt::Display for WorkUnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The durable scheduling record. One row per unit of work, regardless of
/// payload type; `payload` carries the type-specific fields as JSON, tagged
/// by `payload_type` (see `DESIGN.md` for why this isn't one table per type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: i64,
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub state: WorkUnitState,
    pub num_unsatisfied_requirements: i32,
    pub creator_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub leased_until: Option<DateTime<Utc>>,
    pub lease_holder: Option<Uuid>,
    pub node: String,
    pub description: String,
}

impl WorkUnit {
    pub fn is_leased(&self) -> bool {
        self.state == WorkUnitState::Leased
    }

    /// `true` once `leased_until` names a point strictly after `now` — the
    /// "run no sooner than" convention used for both active leases and
    /// units rescheduled back to `Ready`/`Pending`.
    pub fn scheduled_for_future(&self, now: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until > now)
    }
}

/// A brand-new work unit about to be inserted, prior to having an id.
#[derive(Debug, Clone)]
pub struct NewWorkUnit {
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub description: String,
    pub search_terms: Vec<String>,
    pub creator_id: Option<i64>,
}

/// An ordered requirement edge: `source` cannot run until `target` succeeds.
#[derive(Debug, Clone, Copy)]
pub struct RequirementEdge {
    pub source_id: i64,
    pub target_id: i64,
}

/// One row of the append-only delta journal.
#[derive(Debug, Clone)]
pub struct StateCountDelta {
    pub id: i64,
    pub payload_type: String,
    pub from_state: Option<WorkUnitState>,
    pub to_state: Option<WorkUnitState>,
    pub delta: i64,
}

/// Key under which deltas are aggregated and shard counters are stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateCountKey {
    pub payload_type: String,
    pub state: WorkUnitStateOrd,
}

/// `WorkUnitState` doesn't have a meaningful total order on its own; this
/// wrapper gives deltas a deterministic application order (see §4.4: "sorts
/// the resulting keys in a deterministic order").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkUnitStateOrd(pub WorkUnitState);

impl PartialOrd for WorkUnitStateOrd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkUnitStateOrd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.code().cmp(other.0.code())
    }
}

/// The category under which a handler (or the engine itself) logs an
/// exception to the work-exception log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCategory {
    Transient,
    Permanent,
    ContractViolation,
}

impl ExceptionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionCategory::Transient => "transient",
            ExceptionCategory::Permanent => "permanent",
            ExceptionCategory::ContractViolation => "contract_violation",
        }
    }
}

/// One row of the exception log.
#[derive(Debug, Clone)]
pub struct WorkException {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub category: ExceptionCategory,
    pub work_unit_id: i64,
    pub message: String,
    pub stacktrace: String,
}

impl WorkException {
    /// Stack frames are joined with tabs, not newlines, because a frame's
    /// own text may contain embedded newlines.
    pub fn join_frames(frames: &[String]) -> String {
        frames.join("\t")
    }

    pub fn frames(&self) -> Vec<&str> {
        self.stacktrace.split('\t').collect()
    }
}
