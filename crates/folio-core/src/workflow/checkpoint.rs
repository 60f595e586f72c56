//! Durable checkpoints for session recovery.
//!
//! Wraps `WorkflowRepository` with a higher-level API: after every node
//! finishes, a stripped snapshot of the session is appended as a new
//! checkpoint. Checkpoints are never updated; recovery reads the latest
//! one. Writing is best-effort -- a failed write is logged and published
//! but never fails the node that produced the state.

use std::sync::Arc;

use chrono::Utc;
use folio_types::checkpoint::Checkpoint;
use folio_types::error::RepositoryError;
use folio_types::event::WorkflowEvent;
use folio_types::workflow::WorkflowState;
use serde_json::{Value, json};

use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;

/// Marker key placed where an oversized artifact was removed.
pub const STRIPPED_MARKER: &str = "_stripped";

// ---------------------------------------------------------------------------
// Snapshot stripping
// ---------------------------------------------------------------------------

/// Serialize `state` without large binary payloads.
///
/// `documents[].data` is always removed; artifacts whose serialized size
/// exceeds `field_limit` bytes are replaced by
/// `{"_stripped": true, "_original_size": n}`.
pub fn snapshot_state(state: &WorkflowState, field_limit: usize) -> Result<Value, serde_json::Error> {
    let mut snapshot = serde_json::to_value(state)?;

    if let Some(documents) = snapshot.get_mut("documents").and_then(Value::as_array_mut) {
        for document in documents {
            if let Some(fields) = document.as_object_mut() {
                fields.remove("data");
            }
        }
    }

    if let Some(artifacts) = snapshot.get_mut("artifacts").and_then(Value::as_object_mut) {
        for value in artifacts.values_mut() {
            let size = serde_json::to_vec(value)?.len();
            if size > field_limit {
                *value = json!({ STRIPPED_MARKER: true, "_original_size": size });
            }
        }
    }

    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages checkpoint history for workflow sessions.
///
/// Generic over `R: WorkflowRepository` so it works with any storage
/// backend (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: Arc<R>,
    events: EventBus,
    snapshot_field_limit: usize,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>, events: EventBus, snapshot_field_limit: usize) -> Self {
        Self {
            repo,
            events,
            snapshot_field_limit,
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Append a checkpoint, surfacing any failure.
    pub async fn try_save_checkpoint(
        &self,
        session_id: &str,
        node_name: &str,
        state: &WorkflowState,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            session_id: session_id.to_string(),
            node_name: node_name.to_string(),
            timestamp: Utc::now(),
            state_snapshot: snapshot_state(state, self.snapshot_field_limit)?,
        };
        self.repo.append_checkpoint(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Append a checkpoint; failures are logged and published, never returned.
    ///
    /// Returns whether the write succeeded.
    pub async fn save_checkpoint(&self, session_id: &str, node_name: &str, state: &WorkflowState) -> bool {
        match self.try_save_checkpoint(session_id, node_name, state).await {
            Ok(_) => {
                tracing::debug!(session_id, node = node_name, stage = %state.current_stage, "checkpoint saved");
                self.events.publish(WorkflowEvent::CheckpointSaved {
                    session_id: session_id.to_string(),
                    node: node_name.to_string(),
                });
                true
            }
            Err(e) => {
                tracing::warn!(session_id, node = node_name, error = %e, "failed to save checkpoint");
                self.events.publish(WorkflowEvent::CheckpointFailed {
                    session_id: session_id.to_string(),
                    node: node_name.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// State from the most recent checkpoint, or `None` if there is none.
    ///
    /// Read-only: calling it repeatedly returns the same state.
    pub async fn recover_workflow(&self, session_id: &str) -> Result<Option<WorkflowState>, CheckpointError> {
        let Some(checkpoint) = self.repo.latest_checkpoint(session_id).await? else {
            tracing::debug!(session_id, "no checkpoint to recover from");
            return Ok(None);
        };

        let state: WorkflowState =
            serde_json::from_value(checkpoint.state_snapshot).map_err(|source| CheckpointError::Corrupt {
                session_id: session_id.to_string(),
                node_name: checkpoint.node_name.clone(),
                source,
            })?;

        tracing::info!(
            session_id,
            node = %checkpoint.node_name,
            stage = %state.current_stage,
            "recovered workflow from checkpoint"
        );
        Ok(Some(state))
    }

    /// Checkpoint history for a session, oldest first.
    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self.repo.list_checkpoints(session_id).await?)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The state could not be serialized.
    #[error("failed to serialize state snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A stored snapshot no longer deserializes into a workflow state.
    #[error("checkpoint {node_name} for session {session_id} is unreadable: {source}")]
    Corrupt {
        session_id: String,
        node_name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use folio_types::workflow::{SourceDocument, Stage};

    fn manager(limit: usize) -> (CheckpointManager<InMemoryWorkflowRepository>, Arc<InMemoryWorkflowRepository>) {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        (CheckpointManager::new(Arc::clone(&repo), EventBus::new(16), limit), repo)
    }

    fn state_with_payloads() -> WorkflowState {
        let mut state = WorkflowState::new("s1");
        state.current_stage = Stage::Outline;
        state.documents.push(SourceDocument {
            name: "brief.pdf".to_string(),
            media_type: "application/pdf".to_string(),
            extracted_text: "Write about rivers.".to_string(),
            data: Some("JVBERi0xLjQK".repeat(100)),
        });
        state.artifacts.insert("requirements".to_string(), json!({"topic": "rivers"}));
        state.artifacts.insert("raw_research".to_string(), json!("x".repeat(4096)));
        state
    }

    #[test]
    fn snapshot_strips_binary_and_oversized_fields() {
        let snapshot = snapshot_state(&state_with_payloads(), 1024).unwrap();

        assert!(snapshot["documents"][0].get("data").is_none());
        assert_eq!(snapshot["documents"][0]["extracted_text"], "Write about rivers.");
        assert_eq!(snapshot["artifacts"]["requirements"]["topic"], "rivers");
        assert_eq!(snapshot["artifacts"]["raw_research"][STRIPPED_MARKER], true);
        assert_eq!(snapshot["artifacts"]["raw_research"]["_original_size"], 4098);
    }

    #[tokio::test]
    async fn save_then_recover_latest() {
        let (manager, _) = manager(1024);
        let mut state = state_with_payloads();
        assert!(manager.save_checkpoint("s1", "conversation", &state).await);

        state.current_stage = Stage::UnitSpawning;
        assert!(manager.save_checkpoint("s1", "outline", &state).await);

        let recovered = manager.recover_workflow("s1").await.unwrap().unwrap();
        assert_eq!(recovered.current_stage, Stage::UnitSpawning);
        assert_eq!(recovered.documents[0].data, None);
        assert_eq!(manager.list_checkpoints("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let (manager, _) = manager(1024);
        manager.save_checkpoint("s1", "outline", &state_with_payloads()).await;

        let first = manager.recover_workflow("s1").await.unwrap().unwrap();
        let second = manager.recover_workflow("s1").await.unwrap().unwrap();
        assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let (manager, _) = manager(1024);
        assert!(manager.recover_workflow("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_failure_is_swallowed_and_published() {
        let (manager, repo) = manager(1024);
        let mut rx = manager.events.subscribe();
        repo.set_fail_checkpoints(true);

        let saved = manager.save_checkpoint("s1", "outline", &state_with_payloads()).await;
        assert!(!saved);
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkflowEvent::CheckpointFailed { ref node, .. } if node == "outline"
        ));
        assert!(manager.try_save_checkpoint("s1", "outline", &state_with_payloads()).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let (manager, repo) = manager(1024);
        repo.append_checkpoint(&Checkpoint {
            session_id: "s1".to_string(),
            node_name: "outline".to_string(),
            timestamp: Utc::now(),
            state_snapshot: json!({"not": "a state"}),
        })
        .await
        .unwrap();

        let err = manager.recover_workflow("s1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }
}
