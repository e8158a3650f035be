/// Append-only run history
///
/// Finished runs (success, failed or canceled) are recorded once by whoever
/// moved them into their terminal state. Nothing is deleted in normal
/// operation; callers filter by flow and read newest first.

use crate::error::EngineError;
use crate::run::types::{FlowRun, RunSnapshot};
use arc_swap::ArcSwap;
use std::cmp::Reverse;

/// Storage contract for finished runs
pub trait RunRepository: Send + Sync {
    /// Record a finished run; a run id can only be recorded once
    fn append(&self, snapshot: RunSnapshot) -> Result<(), EngineError>;

    fn get(&self, run_id: &str) -> Option<RunSnapshot>;

    /// Every recorded run in insertion order
    fn all(&self) -> Vec<RunSnapshot>;

    /// Drop everything; used between test runs, never by the engine
    fn clear(&self);

    /// Runs for one flow (or all flows), most recent `startedAt` first
    fn list(&self, flow_id: Option<&str>) -> Vec<FlowRun> {
        let mut runs: Vec<FlowRun> = self
            .all()
            .into_iter()
            .map(|s| s.run)
            .filter(|run| flow_id.map_or(true, |id| run.flow_id == id))
            .collect();
        // Stable sort keeps insertion order among equal timestamps; runs without
        // a start time sort last.
        runs.sort_by_key(|run| Reverse(run.started_at));
        runs
    }
}

/// In-memory run history
#[derive(Debug, Default)]
pub struct RunHistory {
    runs: ArcSwap<Vec<RunSnapshot>>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.load().is_empty()
    }
}

impl RunRepository for RunHistory {
    fn append(&self, snapshot: RunSnapshot) -> Result<(), EngineError> {
        let run_id = snapshot.run.id.clone();
        let mut duplicate = false;
        self.runs.rcu(|current| {
            duplicate = current.iter().any(|s| s.run.id == run_id);
            let mut next = (**current).clone();
            if !duplicate {
                next.push(snapshot.clone());
            }
            next
        });

        if duplicate {
            return Err(EngineError::RunExists(run_id));
        }
        tracing::debug!("🗂️ Recorded run {} ({:?})", run_id, snapshot.run.status);
        Ok(())
    }

    fn get(&self, run_id: &str) -> Option<RunSnapshot> {
        self.runs.load().iter().find(|s| s.run.id == run_id).cloned()
    }

    fn all(&self) -> Vec<RunSnapshot> {
        self.runs.load().as_ref().clone()
    }

    fn clear(&self) {
        self.runs.store(Default::default());
    }
}
