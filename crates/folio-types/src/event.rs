//! Event types for the Folio workflow event bus.
//!
//! `WorkflowEvent` is broadcast while a session runs. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::workflow::Stage;

/// Events emitted during workflow execution.
///
/// Consumed by the status surface and by logging/metrics subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A node started executing for a stage.
    NodeStarted {
        session_id: String,
        node: String,
        stage: Stage,
    },

    /// A node finished successfully.
    NodeCompleted {
        session_id: String,
        node: String,
        stage: Stage,
        duration_ms: u64,
    },

    /// A node failed and is being re-run in a degraded configuration.
    NodeRetrying {
        session_id: String,
        node: String,
        retry_count: u32,
        mode: String,
        error: String,
    },

    /// A node failed terminally.
    NodeFailed {
        session_id: String,
        node: String,
        stage: Stage,
        error: String,
        needs_retry: bool,
    },

    /// The session moved to a new stage.
    StageTransition {
        session_id: String,
        from: Stage,
        to: Stage,
    },

    /// Progress changed.
    ProgressUpdated {
        session_id: String,
        stage: Stage,
        current_stage_progress: u8,
        overall_progress: u8,
    },

    /// A dependency layer started.
    LayerStarted {
        session_id: String,
        layer: usize,
        units: Vec<u32>,
    },

    /// Every unit of a layer resolved.
    LayerCompleted {
        session_id: String,
        layer: usize,
        succeeded: usize,
        failed: usize,
    },

    /// A unit finished generating.
    UnitCompleted {
        session_id: String,
        unit_number: u32,
        word_count: u32,
        attempts: u32,
    },

    /// A unit exhausted its recovery ladder.
    UnitFailed {
        session_id: String,
        unit_number: u32,
        error: String,
    },

    /// A checkpoint was written.
    CheckpointSaved {
        session_id: String,
        node: String,
    },

    /// A checkpoint write failed (the workflow continues).
    CheckpointFailed {
        session_id: String,
        node: String,
        error: String,
    },
}

impl WorkflowEvent {
    pub fn session_id(&self) -> &str {
        match self {
            WorkflowEvent::NodeStarted { session_id, .. }
            | WorkflowEvent::NodeCompleted { session_id, .. }
            | WorkflowEvent::NodeRetrying { session_id, .. }
            | WorkflowEvent::NodeFailed { session_id, .. }
            | WorkflowEvent::StageTransition { session_id, .. }
            | WorkflowEvent::ProgressUpdated { session_id, .. }
            | WorkflowEvent::LayerStarted { session_id, .. }
            | WorkflowEvent::LayerCompleted { session_id, .. }
            | WorkflowEvent::UnitCompleted { session_id, .. }
            | WorkflowEvent::UnitFailed { session_id, .. }
            | WorkflowEvent::CheckpointSaved { session_id, .. }
            | WorkflowEvent::CheckpointFailed { session_id, .. } => session_id,
        }
    }
}
