//! Stage transitions and progress accounting.
//!
//! Every function here takes a state by reference and returns a new one;
//! the input is never mutated. Overall progress is a weighted sum over
//! [`STAGE_WEIGHTS`], which the status surface depends on. Changing the
//! weights is a breaking change for that consumer.

use chrono::Utc;
use folio_types::context::ErrorContext;
use folio_types::error::{ErrorCode, StructuredError};
use folio_types::workflow::{SessionStatus, Stage, StageUpdate, WorkflowState};

/// Share of overall progress owned by each pipeline stage. Sums to 100.
pub const STAGE_WEIGHTS: [(Stage, u8); 8] = [
    (Stage::Conversation, 5),
    (Stage::Outline, 10),
    (Stage::UnitSpawning, 5),
    (Stage::UnitGeneration, 50),
    (Stage::ConsistencyReview, 10),
    (Stage::QualityReview, 10),
    (Stage::Formatting, 5),
    (Stage::UserReview, 5),
];

/// Weight of a single stage (0 for terminal stages).
pub fn stage_weight(stage: Stage) -> u8 {
    STAGE_WEIGHTS
        .iter()
        .find(|(s, _)| *s == stage)
        .map_or(0, |(_, w)| *w)
}

/// Overall progress for `stage` at `stage_progress` percent.
///
/// Returns `None` for `failed`, which has no position in the pipeline.
pub fn overall_progress(stage: Stage, stage_progress: u8) -> Option<u8> {
    match stage {
        Stage::Completed => Some(100),
        Stage::Failed => None,
        _ => {
            let before: u32 = STAGE_WEIGHTS
                .iter()
                .take_while(|(s, _)| *s != stage)
                .map(|(_, w)| u32::from(*w))
                .sum();
            let within = u32::from(stage_weight(stage)) * u32::from(stage_progress.min(100)) / 100;
            Some(u8::try_from((before + within).min(100)).unwrap_or(100))
        }
    }
}

/// Whether `from -> to` is a legal transition.
///
/// Legal targets are the successor stage, the same stage (retry in place)
/// and `failed`. Terminal stages are absorbing.
pub fn is_legal_transition(from: Stage, to: Stage) -> bool {
    if from.is_terminal() {
        return false;
    }
    to == from || to == Stage::Failed || from.next() == Some(to)
}

fn invalid_transition(state: &WorkflowState, to: Stage) -> StructuredError {
    StructuredError::stage(
        state.current_stage,
        ErrorCode::InvalidTransition,
        format!("cannot transition from {} to {}", state.current_stage, to),
    )
    .with_context(ErrorContext::for_session(&state.session_id).with_stage(state.current_stage.as_str()))
}

fn apply_overall(state: &mut WorkflowState) {
    if let Some(computed) = overall_progress(state.current_stage, state.progress.current_stage_progress) {
        state.progress.overall_progress = if state.status == SessionStatus::Active {
            state.progress.overall_progress.max(computed)
        } else {
            computed
        };
    }
}

/// Move the session to `next`, merging `update` into the new state.
pub fn transition_to_stage(
    state: &WorkflowState,
    next: Stage,
    update: StageUpdate,
) -> Result<WorkflowState, StructuredError> {
    if !is_legal_transition(state.current_stage, next) {
        return Err(invalid_transition(state, next));
    }

    let mut s = state.clone();
    let advancing = next != state.current_stage;

    if state.current_stage == Stage::UnitGeneration && advancing {
        s.spawning_metadata = None;
    }

    if let Some(outline) = update.outline {
        s.outline = outline;
    }
    if let Some(units) = update.units {
        s.units = Vec::new();
        s.progress.units_completed = 0;
        for unit in units {
            s.record_unit(unit);
        }
    }
    if update.spawning_metadata.is_some() {
        s.spawning_metadata = update.spawning_metadata;
    }
    s.artifacts.extend(update.artifacts);
    if let Some(error) = update.error {
        s.error = Some(error);
    }
    if let Some(needs_retry) = update.needs_retry {
        s.needs_retry = needs_retry;
    }

    s.current_stage = next;
    s.progress.current_stage_progress = 0;

    match next {
        Stage::Completed => {
            s.progress.current_stage_progress = 100;
            s.progress.overall_progress = 100;
            s.status = SessionStatus::Completed;
        }
        Stage::Failed => s.status = SessionStatus::Failed,
        _ => apply_overall(&mut s),
    }

    s.updated_at = Utc::now();
    tracing::debug!(
        session_id = %s.session_id,
        from = %state.current_stage,
        to = %next,
        overall = s.progress.overall_progress,
        "stage transition"
    );
    Ok(s)
}

/// Set progress within the current stage and recompute overall progress.
pub fn update_progress(state: &WorkflowState, stage_progress: u8) -> WorkflowState {
    let mut s = state.clone();
    s.progress.current_stage_progress = stage_progress.min(100);
    apply_overall(&mut s);
    s.updated_at = Utc::now();
    s
}

/// Record a terminal node failure.
///
/// Errors worth a user-triggered retry pause the session at its current
/// stage with `needs_retry`; everything else moves it to `failed`.
pub fn fail(state: &WorkflowState, error: &StructuredError) -> WorkflowState {
    let mut s = state.clone();
    let needs_retry = error.class().user_retryable();
    s.error = Some(error.to_string());
    s.needs_retry = needs_retry;

    if !s.current_stage.is_terminal() {
        if needs_retry {
            s.status = SessionStatus::Paused;
        } else {
            s.current_stage = Stage::Failed;
            s.status = SessionStatus::Failed;
        }
    }

    s.updated_at = Utc::now();
    s
}

/// Reactivate a paused session at the same stage for an explicit retry.
pub fn retry_in_place(state: &WorkflowState) -> Result<WorkflowState, StructuredError> {
    if state.status != SessionStatus::Paused || !state.needs_retry || state.current_stage.is_terminal() {
        return Err(StructuredError::stage(
            state.current_stage,
            ErrorCode::InvalidTransition,
            format!(
                "session {} is {} at {} and cannot be retried",
                state.session_id, state.status, state.current_stage
            ),
        ));
    }

    let mut s = state.clone();
    s.status = SessionStatus::Active;
    s.error = None;
    s.needs_retry = false;
    s.retry_count = 0;
    s.progress.current_stage_progress = 0;
    s.updated_at = Utc::now();
    Ok(s)
}
