//! Unit generation stage.
//!
//! Walks the execution plan layer by layer. Inside a layer every pending
//! unit is generated concurrently through the [`LayerExecutor`]; each unit
//! climbs its own mode ladder, and every rung goes through `with_retry`
//! under a `session/unit-N` tool context. Units that are already completed
//! are skipped, so replaying the stage after a partial failure only
//! regenerates what is missing.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use folio_types::context::ErrorContext;
use folio_types::error::{ErrorClass, ErrorCode, StructuredError};
use folio_types::event::WorkflowEvent;
use folio_types::workflow::{Stage, UnitResult, UnitStatus, WorkUnit, WorkflowState};
use serde::{Deserialize, Serialize};

use super::node::{ExecutionMode, NodeContext, NodeError, StageNode};
use super::parallel::LayerExecutor;
use super::state_machine::update_progress;
use crate::retry::{RetryOptions, with_retry};

/// Context field carrying the number of generator calls made for a unit.
const UNIT_ATTEMPTS_FIELD: &str = "unitAttempts";

/// Everything a generator needs to write one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRequest {
    pub session_id: String,
    pub unit_number: u32,
    pub title: String,
    /// Target size in words for this attempt.
    pub target_size: u32,
    pub mode: ExecutionMode,
    /// Content of completed dependencies, by unit number.
    pub dependency_content: BTreeMap<u32, String>,
}

/// Generated content for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDraft {
    pub content: String,
    pub word_count: u32,
}

impl UnitDraft {
    /// Draft with the word count taken from `content`.
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let word_count = u32::try_from(content.split_whitespace().count()).unwrap_or(u32::MAX);
        Self { content, word_count }
    }
}

/// Produces the content of a single unit.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait UnitGenerator: Send + Sync + 'static {
    /// Tool name recorded in error context.
    fn name(&self) -> &str {
        "unit_generator"
    }

    fn generate(&self, request: &UnitRequest) -> impl Future<Output = Result<UnitDraft, StructuredError>> + Send;
}

/// Stage node for [`Stage::UnitGeneration`].
pub struct UnitGenerationNode<G: UnitGenerator> {
    generator: Arc<G>,
}

impl<G: UnitGenerator> UnitGenerationNode<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator: Arc::new(generator),
        }
    }

    pub fn from_arc(generator: Arc<G>) -> Self {
        Self { generator }
    }
}

impl<G: UnitGenerator> StageNode for UnitGenerationNode<G> {
    fn name(&self) -> &str {
        "unit_generation"
    }

    fn stage(&self) -> Stage {
        Stage::UnitGeneration
    }

    fn validate(&self, state: &WorkflowState) -> bool {
        state.current_stage == Stage::UnitGeneration && state.spawning_metadata.is_some()
    }

    async fn execute_node(&self, state: &WorkflowState, ctx: &NodeContext) -> Result<WorkflowState, NodeError> {
        let Some(metadata) = state.spawning_metadata.as_ref() else {
            return Err(StructuredError::stage(
                Stage::UnitGeneration,
                ErrorCode::ValidationFailed,
                "unit generation requires an execution plan",
            )
            .into());
        };
        let plan = metadata.plan.clone();
        let outline: BTreeMap<u32, WorkUnit> = state.outline.iter().map(|u| (u.unit_number, u.clone())).collect();
        let executor = LayerExecutor::new(ctx.concurrency_limit);
        let mut next = state.clone();

        for (layer_index, layer) in plan.layers.iter().enumerate() {
            let mut runnable = Vec::new();
            for &unit_number in layer {
                if next.unit(unit_number).is_some_and(UnitResult::is_completed) {
                    continue;
                }
                let Some(unit) = outline.get(&unit_number) else {
                    next.record_unit(failed_result(
                        unit_number,
                        format!("Unit {unit_number}"),
                        format!("unit {unit_number} is not in the outline"),
                        0,
                    ));
                    continue;
                };
                let blocked_by: Vec<u32> = unit
                    .dependencies
                    .iter()
                    .copied()
                    .filter(|d| !next.unit(*d).is_some_and(UnitResult::is_completed))
                    .collect();
                if blocked_by.is_empty() {
                    runnable.push(unit_number);
                } else {
                    let reason = format!("blocked by failed dependencies {blocked_by:?}");
                    tracing::warn!(session_id = %state.session_id, unit = unit_number, ?blocked_by, "unit blocked");
                    ctx.events.publish(WorkflowEvent::UnitFailed {
                        session_id: state.session_id.clone(),
                        unit_number,
                        error: reason.clone(),
                    });
                    next.record_unit(failed_result(unit_number, unit.title.clone(), reason, 0));
                }
            }

            if !runnable.is_empty() {
                ctx.events.publish(WorkflowEvent::LayerStarted {
                    session_id: state.session_id.clone(),
                    layer: layer_index,
                    units: runnable.clone(),
                });

                let snapshot = &next;
                let outcome = executor
                    .run_layer(&runnable, |unit_number| {
                        let unit = outline
                            .get(&unit_number)
                            .cloned()
                            .unwrap_or_else(|| WorkUnit::new(unit_number, Vec::new()));
                        let dependency_content: BTreeMap<u32, String> = unit
                            .dependencies
                            .iter()
                            .filter_map(|d| snapshot.unit(*d).map(|r| (*d, r.content.clone())))
                            .collect();
                        generate_unit(
                            Arc::clone(&self.generator),
                            ctx.clone(),
                            state.session_id.clone(),
                            unit,
                            dependency_content,
                        )
                    })
                    .await;

                ctx.events.publish(WorkflowEvent::LayerCompleted {
                    session_id: state.session_id.clone(),
                    layer: layer_index,
                    succeeded: outcome.succeeded.len(),
                    failed: outcome.failed.len(),
                });

                for (_, result) in outcome.succeeded {
                    ctx.events.publish(WorkflowEvent::UnitCompleted {
                        session_id: state.session_id.clone(),
                        unit_number: result.unit_number,
                        word_count: result.word_count,
                        attempts: result.attempts,
                    });
                    next.record_unit(result);
                }
                for (unit_number, error) in outcome.failed {
                    let attempts = error
                        .context
                        .extra
                        .get(UNIT_ATTEMPTS_FIELD)
                        .and_then(serde_json::Value::as_u64)
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or(0);
                    let title = outline
                        .get(&unit_number)
                        .map_or_else(|| format!("Unit {unit_number}"), |u| u.title.clone());
                    ctx.events.publish(WorkflowEvent::UnitFailed {
                        session_id: state.session_id.clone(),
                        unit_number,
                        error: error.to_string(),
                    });
                    next.record_unit(failed_result(unit_number, title, error.to_string(), attempts));
                }
            }

            next = update_progress(&next, layer_progress(&next, &plan.layers));
            ctx.events.publish_progress(&next);
        }

        let failed: Vec<u32> = plan
            .layers
            .iter()
            .flatten()
            .copied()
            .filter(|n| !next.unit(*n).is_some_and(UnitResult::is_completed))
            .collect();

        if failed.is_empty() {
            tracing::info!(
                session_id = %next.session_id,
                units = next.progress.units_completed,
                "all units generated"
            );
            return Ok(next);
        }

        let error = StructuredError::stage(
            Stage::UnitGeneration,
            ErrorCode::UnitGenerationFailed,
            format!("{} of {} units failed: {failed:?}", failed.len(), plan.total_units),
        )
        .with_context_field("failedUnits", failed);
        Err(NodeError::with_state(error, next))
    }
}

/// Completed share of the plan, as a stage percentage.
fn layer_progress(state: &WorkflowState, layers: &[Vec<u32>]) -> u8 {
    let total = layers.iter().map(Vec::len).sum::<usize>();
    if total == 0 {
        return 100;
    }
    let done = layers
        .iter()
        .flatten()
        .filter(|n| state.unit(**n).is_some_and(UnitResult::is_completed))
        .count();
    u8::try_from(done * 100 / total).unwrap_or(100)
}

fn failed_result(unit_number: u32, title: String, error: String, attempts: u32) -> UnitResult {
    UnitResult {
        unit_number,
        title,
        content: String::new(),
        word_count: 0,
        status: UnitStatus::Failed,
        error: Some(error),
        attempts,
    }
}

/// Whether a failed rung should fall through to the next, more degraded one.
fn continue_ladder(error: &StructuredError) -> bool {
    error.is_retryable() || error.class() == ErrorClass::RetryExhausted
}

async fn generate_unit<G: UnitGenerator>(
    generator: Arc<G>,
    ctx: NodeContext,
    session_id: String,
    unit: WorkUnit,
    dependency_content: BTreeMap<u32, String>,
) -> Result<UnitResult, StructuredError> {
    let scope = format!("{session_id}/unit-{}", unit.unit_number);
    let _guard = ctx.contexts.scope(
        scope.as_str(),
        ErrorContext::for_session(session_id.as_str())
            .with_stage(Stage::UnitGeneration.as_str())
            .with_extra("unitNumber", unit.unit_number),
    );
    let operation = format!("generate_unit_{}", unit.unit_number);
    let attempts = Arc::new(AtomicU32::new(0));
    let mut last_error = None;

    for &mode in ctx.mode.ladder() {
        let budget = ctx.degradation.budget(&unit, mode);
        let request = Arc::new(UnitRequest {
            session_id: session_id.clone(),
            unit_number: unit.unit_number,
            title: unit.title.clone(),
            target_size: budget.target_size,
            mode,
            dependency_content: budget
                .dependencies
                .iter()
                .filter_map(|d| dependency_content.get(d).map(|c| (*d, c.clone())))
                .collect(),
        });

        let options = RetryOptions::default().tool(generator.name());
        let call = {
            let generator = Arc::clone(&generator);
            let attempts = Arc::clone(&attempts);
            with_retry(&operation, &ctx.retry_policy, options, move || {
                let generator = Arc::clone(&generator);
                let request = Arc::clone(&request);
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    generator.generate(&request).await
                }
            })
        };

        match ctx
            .contexts
            .execute_with_tool_context(&scope, generator.name(), &operation, call)
            .await
        {
            Ok(draft) => {
                let attempts = attempts.load(Ordering::SeqCst);
                tracing::debug!(
                    session_id = %session_id,
                    unit = unit.unit_number,
                    mode = %mode,
                    attempts,
                    word_count = draft.word_count,
                    "unit generated"
                );
                return Ok(UnitResult {
                    unit_number: unit.unit_number,
                    title: unit.title.clone(),
                    content: draft.content,
                    word_count: draft.word_count,
                    status: UnitStatus::Completed,
                    error: None,
                    attempts,
                });
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    unit = unit.unit_number,
                    mode = %mode,
                    error = %error,
                    "unit attempt failed"
                );
                let keep_going = continue_ladder(&error);
                last_error = Some(error);
                if !keep_going {
                    break;
                }
            }
        }
    }

    let attempts = attempts.load(Ordering::SeqCst);
    let error = last_error.unwrap_or_else(|| {
        StructuredError::stage(
            Stage::UnitGeneration,
            ErrorCode::UnitGenerationFailed,
            format!("unit {} was never attempted", unit.unit_number),
        )
    });
    Err(error.with_context_field(UNIT_ATTEMPTS_FIELD, attempts))
}
