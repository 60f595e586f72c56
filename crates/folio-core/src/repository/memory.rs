//! In-memory `WorkflowRepository` used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use folio_types::checkpoint::{Checkpoint, SessionSummary};
use folio_types::error::RepositoryError;
use folio_types::workflow::{UnitResult, WorkflowState};

use super::workflow::WorkflowRepository;

/// Process-local repository backed by `DashMap`s.
///
/// Checkpoint writes can be forced to fail with
/// [`set_fail_checkpoints`](Self::set_fail_checkpoints) to exercise the
/// best-effort persistence path.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    sessions: DashMap<String, WorkflowState>,
    units: DashMap<String, BTreeMap<u32, UnitResult>>,
    checkpoints: DashMap<String, Vec<Checkpoint>>,
    fail_checkpoints: AtomicBool,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_checkpoints(&self, fail: bool) {
        self.fail_checkpoints.store(fail, Ordering::SeqCst);
    }

    pub fn checkpoint_count(&self, session_id: &str) -> usize {
        self.checkpoints.get(session_id).map_or(0, |c| c.len())
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_session(&self, state: &WorkflowState) -> Result<(), RepositoryError> {
        self.sessions.insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn list_sessions(&self, limit: Option<i64>) -> Result<Vec<SessionSummary>, RepositoryError> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let state = entry.value();
                SessionSummary {
                    session_id: state.session_id.clone(),
                    current_stage: state.current_stage,
                    status: state.status,
                    overall_progress: state.progress.overall_progress,
                    created_at: state.created_at,
                    updated_at: state.updated_at,
                }
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            sessions.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(sessions)
    }

    async fn save_unit_result(&self, session_id: &str, result: &UnitResult) -> Result<(), RepositoryError> {
        self.units
            .entry(session_id.to_string())
            .or_default()
            .insert(result.unit_number, result.clone());
        Ok(())
    }

    async fn list_unit_results(&self, session_id: &str) -> Result<Vec<UnitResult>, RepositoryError> {
        Ok(self
            .units
            .get(session_id)
            .map(|units| units.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        if self.fail_checkpoints.load(Ordering::SeqCst) {
            return Err(RepositoryError::Query("checkpoint store unavailable".to_string()));
        }
        self.checkpoints
            .entry(checkpoint.session_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(session_id).and_then(|checkpoints| {
            checkpoints
                .iter()
                .enumerate()
                .max_by_key(|(seq, c)| (c.timestamp, *seq))
                .map(|(_, c)| c.clone())
        }))
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(session_id)
            .map(|c| c.value().clone())
            .unwrap_or_default())
    }
}
