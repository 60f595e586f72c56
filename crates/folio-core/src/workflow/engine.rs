//! Workflow engine: drives a session through the stage pipeline.
//!
//! The engine owns the stage registry and the shared node context. Each
//! `step` runs the node registered for the session's current stage through
//! the [`NodeRunner`], then either advances to the successor stage or
//! records the failure on the state. After every step the state is
//! checkpointed and the session row (plus completed unit results) is
//! persisted; both writes are best-effort.
//!
//! # Execution flow
//!
//! 1. `start_session` creates a fresh session at `conversation`.
//! 2. `run` steps until the session is no longer active.
//! 3. A paused session is reactivated with `retry_stage`; a session lost
//!    mid-run is picked up from its latest checkpoint with `resume`.

use std::collections::HashMap;
use std::sync::Arc;

use folio_types::config::EngineConfig;
use folio_types::context::ErrorContext;
use folio_types::error::{ErrorCode, RepositoryError, StructuredError};
use folio_types::event::WorkflowEvent;
use folio_types::workflow::{SourceDocument, Stage, StageUpdate, WorkflowState};
use uuid::Uuid;

use crate::error_context::ErrorContextStore;
use crate::event::EventBus;
use crate::metrics::MetricsSink;
use crate::repository::workflow::WorkflowRepository;

use super::box_node::BoxStageNode;
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::node::{DegradationPolicy, NodeContext, NodeError, NodeRunner, StageNode};
use super::state_machine::{fail, retry_in_place, transition_to_stage};

/// Node name used for checkpoints the engine writes itself.
const ENGINE_NODE: &str = "engine";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by engine operations.
///
/// Node failures are not errors here: they are recorded on the returned
/// state (`error`, `needs_retry`, `status`).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("workflow error: {0}")]
    Workflow(#[from] StructuredError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Stage-pipeline engine with durable checkpointing.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowEngine<R: WorkflowRepository> {
    nodes: HashMap<Stage, BoxStageNode>,
    runner: NodeRunner,
    checkpoints: CheckpointManager<R>,
    repo: Arc<R>,
    context: NodeContext,
}

impl<R: WorkflowRepository> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>, config: &EngineConfig) -> Self {
        let context = NodeContext::new(config);
        let checkpoints = CheckpointManager::new(Arc::clone(&repo), context.events.clone(), config.snapshot_field_limit);
        Self {
            nodes: HashMap::new(),
            runner: NodeRunner::new(config.max_recovery_retries),
            checkpoints,
            repo,
            context,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.context.metrics = metrics;
        self
    }

    pub fn with_degradation(mut self, policy: Arc<dyn DegradationPolicy>) -> Self {
        self.context.degradation = policy;
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_node<N: StageNode + 'static>(mut self, node: N) -> Self {
        self.register(node);
        self
    }

    /// Register `node` for its stage, replacing any previous node.
    pub fn register<N: StageNode + 'static>(&mut self, node: N) {
        let stage = node.stage();
        if let Some(previous) = self.nodes.insert(stage, BoxStageNode::new(node)) {
            tracing::debug!(stage = %stage, replaced = previous.name(), "stage node replaced");
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.context.events
    }

    pub fn contexts(&self) -> &Arc<ErrorContextStore> {
        &self.context.contexts
    }

    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoints
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Create and persist a fresh session at the first stage.
    pub async fn start_session(&self, documents: Vec<SourceDocument>) -> WorkflowState {
        let mut state = WorkflowState::new(Uuid::now_v7().to_string());
        state.documents = documents;
        tracing::info!(session_id = %state.session_id, documents = state.documents.len(), "session started");
        self.persist(&state).await;
        state
    }

    /// Run the current stage's node once and apply the outcome.
    ///
    /// Inactive or terminal sessions are returned unchanged.
    pub async fn step(&self, state: WorkflowState) -> Result<WorkflowState, EngineError> {
        if !state.is_active() || state.current_stage.is_terminal() {
            return Ok(state);
        }

        let stage = state.current_stage;
        let Some(node) = self.nodes.get(&stage) else {
            let error = StructuredError::stage(
                stage,
                ErrorCode::CriticalWorkflow,
                format!("no node registered for stage {stage}"),
            )
            .with_context(ErrorContext::for_session(state.session_id.as_str()).with_stage(stage.as_str()));
            return Ok(self.record_failure(ENGINE_NODE, stage, state, &error).await);
        };

        match self.runner.execute(node, &state, &self.context).await {
            Ok(next) => {
                let Some(target) = stage.next() else {
                    return Ok(next);
                };
                let advanced = transition_to_stage(&next, target, StageUpdate::none())?;

                self.context.events.publish_transition(&advanced, stage);
                self.context.events.publish_progress(&advanced);
                tracing::info!(
                    session_id = %advanced.session_id,
                    from = %stage,
                    to = %target,
                    overall = advanced.progress.overall_progress,
                    "stage completed"
                );

                self.checkpoints
                    .save_checkpoint(&advanced.session_id, node.name(), &advanced)
                    .await;
                self.persist(&advanced).await;
                Ok(advanced)
            }
            Err(NodeError { error, state: partial }) => {
                let base = partial.map_or(state, |s| *s);
                Ok(self.record_failure(node.name(), stage, base, &error).await)
            }
        }
    }

    /// Step until the session is no longer active.
    pub async fn run(&self, state: WorkflowState) -> Result<WorkflowState, EngineError> {
        let mut state = state;
        while state.is_active() && !state.current_stage.is_terminal() {
            state = self.step(state).await?;
        }
        tracing::info!(
            session_id = %state.session_id,
            stage = %state.current_stage,
            status = %state.status,
            "run finished"
        );
        Ok(state)
    }

    /// Load the latest checkpoint (or the stored session) and continue it.
    pub async fn resume(&self, session_id: &str) -> Result<WorkflowState, EngineError> {
        let state = match self.checkpoints.recover_workflow(session_id).await? {
            Some(state) => state,
            None => self
                .repo
                .get_session(session_id)
                .await?
                .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?,
        };
        self.run(state).await
    }

    /// Explicit user retry of a paused stage, then continue the run.
    pub async fn retry_stage(&self, state: WorkflowState) -> Result<WorkflowState, EngineError> {
        let reactivated = retry_in_place(&state)?;
        tracing::info!(
            session_id = %reactivated.session_id,
            stage = %reactivated.current_stage,
            "retrying stage"
        );
        self.persist(&reactivated).await;
        self.run(reactivated).await
    }

    /// Start over with a new session that keeps the source documents.
    pub async fn restart(&self, state: &WorkflowState) -> Result<WorkflowState, EngineError> {
        if state.is_active() {
            return Err(StructuredError::stage(
                state.current_stage,
                ErrorCode::InvalidTransition,
                format!("session {} is still active", state.session_id),
            )
            .into());
        }
        let fresh = self.start_session(state.documents.clone()).await;
        tracing::info!(
            previous = %state.session_id,
            session_id = %fresh.session_id,
            "session restarted"
        );
        Ok(fresh)
    }

    async fn record_failure(
        &self,
        node_name: &str,
        stage: Stage,
        state: WorkflowState,
        error: &StructuredError,
    ) -> WorkflowState {
        let failed = fail(&state, error);
        tracing::error!(
            session_id = %failed.session_id,
            node = node_name,
            stage = %stage,
            needs_retry = failed.needs_retry,
            error = %error,
            "stage failed"
        );
        self.context.events.publish(WorkflowEvent::NodeFailed {
            session_id: failed.session_id.clone(),
            node: node_name.to_string(),
            stage,
            error: error.to_string(),
            needs_retry: failed.needs_retry,
        });
        if failed.current_stage != stage {
            self.context.events.publish_transition(&failed, stage);
        }

        self.checkpoints
            .save_checkpoint(&failed.session_id, node_name, &failed)
            .await;
        self.persist(&failed).await;
        failed
    }

    /// Save the session row and completed unit results; failures are logged.
    async fn persist(&self, state: &WorkflowState) {
        let contexts = &self.context.contexts;
        let scope = state.session_id.as_str();

        let saved = contexts
            .execute_with_store_context(scope, "save_session", "sessions", async {
                self.repo.save_session(state).await.map_err(StructuredError::from)
            })
            .await;
        if let Err(e) = saved {
            tracing::warn!(session_id = scope, error = %e, "failed to persist session");
        }

        for unit in state.units.iter().filter(|u| u.is_completed()) {
            let saved = contexts
                .execute_with_store_context(scope, "save_unit_result", "unit_results", async {
                    self.repo
                        .save_unit_result(scope, unit)
                        .await
                        .map_err(StructuredError::from)
                })
                .await;
            if let Err(e) = saved {
                tracing::warn!(session_id = scope, unit = unit.unit_number, error = %e, "failed to persist unit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::generation::tests::{ScriptedGenerator, outline};
    use crate::workflow::generation::UnitGenerationNode;
    use crate::workflow::node::tests::ScriptedNode;
    use crate::workflow::spawning::UnitSpawningNode;
    use folio_types::error::ErrorClass;
    use folio_types::retry::RetryPolicy;
    use folio_types::workflow::SessionStatus;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::new(1, Duration::from_millis(1), 2.0, Duration::from_millis(2)),
            ..EngineConfig::default()
        }
    }

    fn engine(
        repo: &Arc<InMemoryWorkflowRepository>,
        generator: Arc<ScriptedGenerator>,
    ) -> WorkflowEngine<InMemoryWorkflowRepository> {
        let mut engine = WorkflowEngine::new(Arc::clone(repo), &config());
        for stage in Stage::PIPELINE {
            match stage {
                Stage::UnitSpawning => engine.register(UnitSpawningNode),
                Stage::UnitGeneration => engine.register(UnitGenerationNode::from_arc(Arc::clone(&generator))),
                other => engine.register(ScriptedNode::new(other, vec![])),
            }
        }
        engine
    }

    async fn started(engine: &WorkflowEngine<InMemoryWorkflowRepository>) -> WorkflowState {
        let mut state = engine.start_session(Vec::new()).await;
        state.outline = outline();
        state
    }

    #[tokio::test]
    async fn full_run_completes_and_persists() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = engine(&repo, Arc::new(ScriptedGenerator::default()));
        let state = started(&engine).await;
        let mut rx = engine.events().subscribe_session(state.session_id.as_str());
        let done = engine.run(state).await.unwrap();

        assert_eq!(done.current_stage, Stage::Completed);
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.progress.overall_progress, 100);
        assert_eq!(done.progress.units_completed, 4);
        assert!(done.spawning_metadata.is_none());

        assert_eq!(repo.checkpoint_count(&done.session_id), Stage::PIPELINE.len());
        let stored = repo.get_session(&done.session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(repo.list_unit_results(&done.session_id).await.unwrap().len(), 4);

        let mut last = 0;
        for event in rx.drain() {
            if let WorkflowEvent::ProgressUpdated { overall_progress, .. } = event {
                assert!(overall_progress >= last, "progress went backwards");
                last = overall_progress;
            }
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn failed_units_pause_then_retry_completes() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let first = engine(&repo, Arc::new(ScriptedGenerator::failing(&[2])));
        let paused = first.run(started(&first).await).await.unwrap();

        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(paused.current_stage, Stage::UnitGeneration);
        assert!(paused.needs_retry);
        assert!(paused.error.as_deref().unwrap().contains("unit_generation_failed"));
        assert!(paused.unit(1).unwrap().is_completed());

        let generator = Arc::new(ScriptedGenerator::default());
        let second = engine(&repo, Arc::clone(&generator));
        let recovered = second.checkpoints().recover_workflow(&paused.session_id).await.unwrap().unwrap();
        let done = second.retry_stage(recovered).await.unwrap();

        assert_eq!(done.current_stage, Stage::Completed);
        assert!(generator.calls_for(1).is_empty());
        assert_eq!(generator.calls_for(2).len(), 1);
    }

    #[tokio::test]
    async fn resume_continues_from_latest_checkpoint() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let first = engine(&repo, Arc::new(ScriptedGenerator::default()));
        let state = started(&first).await;
        let state = first.step(state).await.unwrap();
        let state = first.step(state).await.unwrap();
        assert_eq!(state.current_stage, Stage::UnitSpawning);

        let second = engine(&repo, Arc::new(ScriptedGenerator::default()));
        let done = second.resume(&state.session_id).await.unwrap();
        assert_eq!(done.current_stage, Stage::Completed);
        assert_eq!(done.session_id, state.session_id);
    }

    #[tokio::test]
    async fn resume_unknown_session_is_an_error() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = engine(&repo, Arc::new(ScriptedGenerator::default()));
        let err = engine.resume("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn missing_node_fails_critically() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = WorkflowEngine::new(Arc::clone(&repo), &config());
        let state = engine.start_session(Vec::new()).await;

        let failed = engine.run(state).await.unwrap();
        assert_eq!(failed.current_stage, Stage::Failed);
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(!failed.needs_retry);
        assert!(failed.error.as_deref().unwrap().contains("critical_workflow"));
        assert_eq!(repo.checkpoint_count(&failed.session_id), 1);
    }

    #[tokio::test]
    async fn validation_failure_moves_to_failed() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = engine(&repo, Arc::new(ScriptedGenerator::default()));
        let state = engine.start_session(Vec::new()).await;

        let failed = engine.run(state).await.unwrap();
        assert_eq!(failed.current_stage, Stage::Failed);
        assert!(failed.error.as_deref().unwrap().contains("validation_failed"));
        assert!(!ErrorClass::Validation.user_retryable());
    }

    #[tokio::test]
    async fn retry_requires_paused_session() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = engine(&repo, Arc::new(ScriptedGenerator::default()));
        let state = engine.start_session(Vec::new()).await;

        let err = engine.retry_stage(state).await.unwrap_err();
        assert!(matches!(err, EngineError::Workflow(ref e) if e.code == ErrorCode::InvalidTransition));
    }

    #[tokio::test]
    async fn restart_keeps_documents() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let engine = WorkflowEngine::new(Arc::clone(&repo), &config());
        let document = SourceDocument {
            name: "notes.txt".to_string(),
            media_type: "text/plain".to_string(),
            extracted_text: "notes".to_string(),
            data: None,
        };
        let state = engine.start_session(vec![document.clone()]).await;
        assert!(engine.restart(&state).await.is_err());

        let failed = engine.run(state).await.unwrap();
        let fresh = engine.restart(&failed).await.unwrap();
        assert_ne!(fresh.session_id, failed.session_id);
        assert_eq!(fresh.current_stage, Stage::Conversation);
        assert_eq!(fresh.documents, vec![document]);
    }

    #[tokio::test]
    async fn checkpoint_failures_do_not_stop_the_run() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        repo.set_fail_checkpoints(true);
        let engine = engine(&repo, Arc::new(ScriptedGenerator::default()));

        let done = engine.run(started(&engine).await).await.unwrap();
        assert_eq!(done.current_stage, Stage::Completed);
        assert_eq!(repo.checkpoint_count(&done.session_id), 0);
    }

    #[tokio::test]
    async fn transient_stage_failure_recovers_in_degraded_mode() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let mut engine = engine(&repo, Arc::new(ScriptedGenerator::default()));
        engine.register(ScriptedNode::new(
            Stage::Conversation,
            vec![Err(StructuredError::tool("interviewer", ErrorCode::ToolRateLimit, "429 rate limit"))],
        ));

        let state = engine.step(started(&engine).await).await.unwrap();
        assert_eq!(state.current_stage, Stage::Outline);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.artifacts["conversation"]["mode"], "degraded");
    }

    #[tokio::test]
    async fn recovery_budget_is_shared_across_stages() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let single_retry = EngineConfig {
            max_recovery_retries: 1,
            ..config()
        };
        let mut engine = WorkflowEngine::new(Arc::clone(&repo), &single_retry);
        for stage in Stage::PIPELINE {
            engine.register(ScriptedNode::new(stage, vec![]));
        }
        let rate_limited = |tool: &str| StructuredError::tool(tool, ErrorCode::ToolRateLimit, "429 rate limit");
        engine.register(ScriptedNode::new(Stage::Conversation, vec![Err(rate_limited("interviewer"))]));
        engine.register(ScriptedNode::new(Stage::Outline, vec![Err(rate_limited("planner"))]));

        let state = engine.step(started(&engine).await).await.unwrap();
        assert_eq!(state.current_stage, Stage::Outline);
        assert_eq!(state.retry_count, 1);

        let paused = engine.step(state).await.unwrap();
        assert_eq!(paused.current_stage, Stage::Outline);
        assert_eq!(paused.status, SessionStatus::Paused);
        assert!(paused.needs_retry);
        assert!(paused.error.as_deref().unwrap().contains("max_retries_exceeded"));
        assert!(!paused.artifacts.contains_key("outline"));

        let done = engine.retry_stage(paused).await.unwrap();
        assert_eq!(done.current_stage, Stage::Completed);
        assert_eq!(done.artifacts["outline"]["mode"], "normal");
    }
}
