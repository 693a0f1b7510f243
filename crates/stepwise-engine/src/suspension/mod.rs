//! Parking place for runs waiting on a human decision.
//!
//! A run that reaches a `user-approval` node does not hold a task open. The
//! engine hands back a [`SuspendedRun`] holding the context and a cursor; it
//! goes into a [`SuspensionStore`] until a [`ResumeSignal`] arrives.

mod memory;
mod sqlite;

pub use memory::MemorySuspensionStore;
pub use sqlite::SqliteSuspensionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stepwise_core::error::Result;
use stepwise_core::types::RunId;

use crate::context::ExecutionContext;
use crate::graph::{Decision, WorkflowGraph};

/// Everything needed to continue a run at its approval node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedRun {
    pub run_id: RunId,
    pub graph: WorkflowGraph,
    pub context: ExecutionContext,
    /// Id of the approval node the run is parked on.
    pub cursor: String,
    /// Resolved prompt shown to the approver.
    pub prompt: String,
    pub suspended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub on_timeout: Decision,
}

impl SuspendedRun {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Out-of-band decision for a suspended run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSignal {
    pub run_id: RunId,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ResumeSignal {
    pub fn approve(run_id: RunId) -> Self {
        Self {
            run_id,
            decision: Decision::Approve,
            note: None,
        }
    }

    pub fn reject(run_id: RunId) -> Self {
        Self {
            run_id,
            decision: Decision::Reject,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Takes custody of a run at the moment it suspends.
///
/// The engine calls `park` before the run's `suspended` event is emitted, so
/// anyone reacting to that event can already resume the run. An error fails
/// the run at its approval node instead.
pub trait Parking: Send + Sync {
    fn park(&self, run: &SuspendedRun) -> Result<()>;
}

/// Storage for suspended runs, keyed by run id.
pub trait SuspensionStore: Send + Sync {
    /// Store a suspended run, replacing any earlier entry for the same id.
    fn save(&self, run: &SuspendedRun) -> Result<()>;

    /// Remove and return a suspended run. `RunNotFound` if there is none.
    fn take(&self, run_id: &RunId) -> Result<SuspendedRun>;

    fn get(&self, run_id: &RunId) -> Result<Option<SuspendedRun>>;

    /// All suspended runs, oldest first.
    fn list(&self) -> Result<Vec<SuspendedRun>>;

    /// Runs whose approval deadline is at or before `now`.
    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<SuspendedRun>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|run| run.is_expired(now))
            .collect())
    }

    fn remove(&self, run_id: &RunId) -> Result<bool>;
}

#[cfg(test)]
pub(crate) fn sample_run(id: &str, expires_at: Option<DateTime<Utc>>) -> SuspendedRun {
    let graph = WorkflowGraph::from_value(stepwise_test_utils::approval_graph())
        .unwrap_or_else(|e| panic!("fixture graph: {e}"));
    SuspendedRun {
        run_id: RunId::from_string(id),
        graph,
        context: ExecutionContext::default(),
        cursor: "approve".into(),
        prompt: "Publish draft?".into(),
        suspended_at: Utc::now(),
        expires_at,
        on_timeout: Decision::Reject,
    }
}
