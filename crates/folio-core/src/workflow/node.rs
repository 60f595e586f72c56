//! Stage node contract and the recovery-aware node runner.
//!
//! Every pipeline stage is implemented as a [`StageNode`]. The
//! [`NodeRunner`] drives the common lifecycle: scope the error context,
//! check preconditions, execute with metric capture, and on failure walk
//! the recovery ladder (degraded re-runs, one reduced-complexity re-run,
//! then `max_retries_exceeded`).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use folio_types::config::EngineConfig;
use folio_types::context::ErrorContext;
use folio_types::error::{ErrorCode, StructuredError};
use folio_types::event::WorkflowEvent;
use folio_types::retry::RetryPolicy;
use folio_types::workflow::{Stage, WorkUnit, WorkflowState};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error_context::ErrorContextStore;
use crate::event::EventBus;
use crate::metrics::{MetricsSink, NoopMetrics};

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

/// Configuration a node runs with on a given attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Normal,
    /// Smaller targets, fewer dependencies.
    Degraded,
    /// Last resort: smallest targets, no dependency context. Used once.
    ReducedComplexity,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Normal => "normal",
            ExecutionMode::Degraded => "degraded",
            ExecutionMode::ReducedComplexity => "reduced_complexity",
        }
    }

    /// This mode followed by every more degraded mode.
    pub fn ladder(self) -> &'static [ExecutionMode] {
        const LADDER: [ExecutionMode; 3] = [
            ExecutionMode::Normal,
            ExecutionMode::Degraded,
            ExecutionMode::ReducedComplexity,
        ];
        match self {
            ExecutionMode::Normal => &LADDER,
            ExecutionMode::Degraded => &LADDER[1..],
            ExecutionMode::ReducedComplexity => &LADDER[2..],
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Degradation policy
// ---------------------------------------------------------------------------

/// Size target and dependency context for one generation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitBudget {
    pub target_size: u32,
    /// Dependencies whose content is passed to the generator.
    pub dependencies: Vec<u32>,
}

/// Decides how much a unit shrinks in each execution mode.
pub trait DegradationPolicy: Send + Sync {
    fn budget(&self, unit: &WorkUnit, mode: ExecutionMode) -> UnitBudget;
}

/// Scales the size target and trims dependency context by fixed ratios.
#[derive(Debug, Clone)]
pub struct ProportionalDegradation {
    pub degraded_size_ratio: f64,
    /// Most recent dependencies kept in degraded mode.
    pub degraded_max_dependencies: usize,
    pub reduced_size_ratio: f64,
}

impl Default for ProportionalDegradation {
    fn default() -> Self {
        Self {
            degraded_size_ratio: 0.8,
            degraded_max_dependencies: 2,
            reduced_size_ratio: 0.6,
        }
    }
}

fn scale(size: u32, ratio: f64) -> u32 {
    (f64::from(size) * ratio.clamp(0.0, 1.0)).round() as u32
}

impl DegradationPolicy for ProportionalDegradation {
    fn budget(&self, unit: &WorkUnit, mode: ExecutionMode) -> UnitBudget {
        let mut dependencies = unit.dependencies.clone();
        dependencies.sort_unstable();
        dependencies.dedup();

        match mode {
            ExecutionMode::Normal => UnitBudget {
                target_size: unit.estimated_size,
                dependencies,
            },
            ExecutionMode::Degraded => {
                let skip = dependencies.len().saturating_sub(self.degraded_max_dependencies);
                UnitBudget {
                    target_size: scale(unit.estimated_size, self.degraded_size_ratio),
                    dependencies: dependencies.split_off(skip),
                }
            }
            ExecutionMode::ReducedComplexity => UnitBudget {
                target_size: scale(unit.estimated_size, self.reduced_size_ratio),
                dependencies: Vec::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Node context and errors
// ---------------------------------------------------------------------------

/// Shared collaborators handed to every node invocation.
#[derive(Clone)]
pub struct NodeContext {
    pub mode: ExecutionMode,
    /// Policy for external calls made by the node.
    pub retry_policy: RetryPolicy,
    /// Units generated concurrently within a layer.
    pub concurrency_limit: usize,
    pub contexts: Arc<ErrorContextStore>,
    pub events: EventBus,
    pub metrics: Arc<dyn MetricsSink>,
    pub degradation: Arc<dyn DegradationPolicy>,
}

impl NodeContext {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            mode: ExecutionMode::Normal,
            retry_policy: config.retry.clone(),
            concurrency_limit: config.effective_concurrency(),
            contexts: Arc::new(ErrorContextStore::new()),
            events: EventBus::new(config.event_capacity),
            metrics: Arc::new(NoopMetrics),
            degradation: Arc::new(ProportionalDegradation::default()),
        }
    }

    /// Same collaborators, different mode.
    pub fn with_mode(&self, mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("mode", &self.mode)
            .field("retry_policy", &self.retry_policy)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("metrics", &self.metrics.name())
            .finish_non_exhaustive()
    }
}

/// A failed node invocation.
///
/// `state` carries whatever the node produced before failing (completed
/// unit results, for example) so that work is not lost on recovery.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct NodeError {
    #[source]
    pub error: StructuredError,
    pub state: Option<Box<WorkflowState>>,
}

impl NodeError {
    pub fn with_state(error: StructuredError, state: WorkflowState) -> Self {
        Self {
            error,
            state: Some(Box::new(state)),
        }
    }
}

impl From<StructuredError> for NodeError {
    fn from(error: StructuredError) -> Self {
        Self { error, state: None }
    }
}

// ---------------------------------------------------------------------------
// StageNode trait
// ---------------------------------------------------------------------------

/// One pipeline stage implementation.
///
/// Nodes must tolerate being invoked more than once for the same stage
/// (recovery and checkpoint replay both re-run them).
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait StageNode: Send + Sync {
    fn name(&self) -> &str;

    /// Stage this node is registered for.
    fn stage(&self) -> Stage;

    /// Preconditions. `false` fails the stage without retry.
    fn validate(&self, state: &WorkflowState) -> bool;

    fn execute_node(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> impl Future<Output = Result<WorkflowState, NodeError>> + Send;
}

// ---------------------------------------------------------------------------
// NodeRunner
// ---------------------------------------------------------------------------

/// Runs nodes with validation, metric capture and bounded recovery.
#[derive(Debug, Clone, Copy)]
pub struct NodeRunner {
    max_retries: u32,
}

impl NodeRunner {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Validate, execute, and route failures into [`recover`](Self::recover).
    pub async fn execute<N: StageNode>(
        &self,
        node: &N,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<WorkflowState, NodeError> {
        let scope = state.session_id.as_str();
        let _guard = ctx.contexts.scope(
            scope,
            ErrorContext::for_session(scope)
                .with_stage(node.stage().as_str())
                .with_operation(node.name()),
        );

        if !node.validate(state) {
            let error = StructuredError::stage(
                node.stage(),
                ErrorCode::ValidationFailed,
                format!(
                    "{} preconditions not met (session at {}, status {})",
                    node.name(),
                    state.current_stage,
                    state.status
                ),
            );
            tracing::warn!(session_id = scope, node = node.name(), "node validation failed");
            return Err(ctx.contexts.enrich(error, scope, ErrorContext::new()).into());
        }

        match self.run_instrumented(node, state, ctx).await {
            Ok(next) => Ok(next),
            Err(NodeError { error, state: partial }) => {
                let error = ctx.contexts.enrich(error, scope, ErrorContext::new());
                let base = partial.map_or_else(|| state.clone(), |s| *s);
                self.recover(node, base, error, ctx).await
            }
        }
    }

    /// Re-run a failed node in progressively degraded modes.
    ///
    /// The retry bound is checked before anything else: a state already at
    /// `max_retries` fails with `max_retries_exceeded` without re-executing,
    /// whatever the underlying error.
    pub async fn recover<N: StageNode>(
        &self,
        node: &N,
        state: WorkflowState,
        error: StructuredError,
        ctx: &NodeContext,
    ) -> Result<WorkflowState, NodeError> {
        let mut state = state;
        let mut error = error;

        loop {
            if state.retry_count >= self.max_retries {
                let exceeded = StructuredError::stage(
                    node.stage(),
                    ErrorCode::MaxRetriesExceeded,
                    format!(
                        "Maximum retries exceeded for {} ({} of {}): {}",
                        node.name(),
                        state.retry_count,
                        self.max_retries,
                        error.message
                    ),
                )
                .with_context(error.context.clone())
                .with_context_field("retryCount", state.retry_count)
                .with_cause(error);
                tracing::error!(
                    session_id = %state.session_id,
                    node = node.name(),
                    retry_count = state.retry_count,
                    "maximum retries exceeded"
                );
                return Err(NodeError::with_state(exceeded, state));
            }

            if !error.is_recoverable() {
                return Err(NodeError::with_state(error, state));
            }

            state.retry_count += 1;
            let mode = if self.max_retries >= 2 && state.retry_count == self.max_retries {
                ExecutionMode::ReducedComplexity
            } else {
                ExecutionMode::Degraded
            };

            tracing::warn!(
                session_id = %state.session_id,
                node = node.name(),
                retry_count = state.retry_count,
                mode = %mode,
                error = %error,
                "recovering node"
            );
            ctx.events.publish(WorkflowEvent::NodeRetrying {
                session_id: state.session_id.clone(),
                node: node.name().to_string(),
                retry_count: state.retry_count,
                mode: mode.to_string(),
                error: error.to_string(),
            });

            match self.run_instrumented(node, &state, &ctx.with_mode(mode)).await {
                Ok(mut next) => {
                    next.error = None;
                    next.needs_retry = false;
                    return Ok(next);
                }
                Err(NodeError { error: next_error, state: partial }) => {
                    if let Some(partial) = partial {
                        let retry_count = state.retry_count;
                        state = *partial;
                        state.retry_count = retry_count;
                    }
                    error = ctx
                        .contexts
                        .enrich(next_error, &state.session_id, ErrorContext::new());
                }
            }
        }
    }

    async fn run_instrumented<N: StageNode>(
        &self,
        node: &N,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<WorkflowState, NodeError> {
        let started = Instant::now();
        ctx.metrics.record(
            "node_started",
            json!({
                "session_id": state.session_id,
                "node": node.name(),
                "stage": node.stage(),
                "mode": ctx.mode,
            }),
        );
        ctx.events.publish(WorkflowEvent::NodeStarted {
            session_id: state.session_id.clone(),
            node: node.name().to_string(),
            stage: node.stage(),
        });

        let result = node.execute_node(state, ctx).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        ctx.metrics.record(
            "node_completed",
            json!({
                "session_id": state.session_id,
                "node": node.name(),
                "mode": ctx.mode,
                "duration_ms": duration_ms,
                "success": result.is_ok(),
            }),
        );

        match &result {
            Ok(_) => {
                tracing::debug!(
                    session_id = %state.session_id,
                    node = node.name(),
                    mode = %ctx.mode,
                    duration_ms,
                    "node completed"
                );
                ctx.events.publish(WorkflowEvent::NodeCompleted {
                    session_id: state.session_id.clone(),
                    node: node.name().to_string(),
                    stage: node.stage(),
                    duration_ms,
                });
            }
            Err(err) => tracing::debug!(
                session_id = %state.session_id,
                node = node.name(),
                mode = %ctx.mode,
                duration_ms,
                error = %err,
                "node attempt failed"
            ),
        }

        result
    }
}
