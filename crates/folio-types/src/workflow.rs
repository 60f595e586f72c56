//! Workflow domain types for Folio.
//!
//! `WorkflowState` is the single record threaded through the pipeline. It is
//! treated as a value: every stage takes a state and returns a new one. This
//! module also defines the outline types (`WorkUnit`), generated results
//! (`UnitResult`) and the derived `ExecutionPlan`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One phase of the fixed generation pipeline.
///
/// Declaration order is the pipeline order; `Completed` and `Failed` are the
/// two terminal stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Conversation,
    Outline,
    UnitSpawning,
    UnitGeneration,
    ConsistencyReview,
    QualityReview,
    Formatting,
    UserReview,
    Completed,
    Failed,
}

impl Stage {
    /// The non-terminal stages in pipeline order.
    pub const PIPELINE: [Stage; 8] = [
        Stage::Conversation,
        Stage::Outline,
        Stage::UnitSpawning,
        Stage::UnitGeneration,
        Stage::ConsistencyReview,
        Stage::QualityReview,
        Stage::Formatting,
        Stage::UserReview,
    ];

    /// The legal successor of this stage, or `None` for terminal stages.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Conversation => Some(Stage::Outline),
            Stage::Outline => Some(Stage::UnitSpawning),
            Stage::UnitSpawning => Some(Stage::UnitGeneration),
            Stage::UnitGeneration => Some(Stage::ConsistencyReview),
            Stage::ConsistencyReview => Some(Stage::QualityReview),
            Stage::QualityReview => Some(Stage::Formatting),
            Stage::Formatting => Some(Stage::UserReview),
            Stage::UserReview => Some(Stage::Completed),
            Stage::Completed | Stage::Failed => None,
        }
    }

    /// Whether this stage is absorbing (no transition out is legal).
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Stable snake_case name, identical to the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Conversation => "conversation",
            Stage::Outline => "outline",
            Stage::UnitSpawning => "unit_spawning",
            Stage::UnitGeneration => "unit_generation",
            Stage::ConsistencyReview => "consistency_review",
            Stage::QualityReview => "quality_review",
            Stage::Formatting => "formatting",
            Stage::UserReview => "user_review",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown stage: {s}"))
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Paused,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown session status: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress counters read by the status surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Progress within the current stage (0-100).
    pub current_stage_progress: u8,
    /// Weighted progress across the whole pipeline (0-100).
    pub overall_progress: u8,
    /// Units generated so far.
    pub units_completed: u32,
    /// Units declared by the execution plan.
    pub total_units: u32,
}

// ---------------------------------------------------------------------------
// Outline / work units
// ---------------------------------------------------------------------------

/// Fixed part of every unit's duration estimate.
pub const BASE_UNIT_DURATION_MS: u64 = 10_000;

/// Per-word part of every unit's duration estimate.
pub const UNIT_MS_PER_WORD: u64 = 20;

/// A declared piece of independently generatable content (a chapter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unique within a plan.
    pub unit_number: u32,
    #[serde(default)]
    pub title: String,
    /// Unit numbers this unit builds on.
    #[serde(default)]
    pub dependencies: Vec<u32>,
    /// Target size in words.
    #[serde(default)]
    pub estimated_size: u32,
}

impl WorkUnit {
    pub fn new(unit_number: u32, dependencies: Vec<u32>) -> Self {
        Self {
            unit_number,
            title: format!("Chapter {unit_number}"),
            dependencies,
            estimated_size: 0,
        }
    }

    /// Expected wall-clock generation time, driven by `estimated_size`.
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_millis(
            BASE_UNIT_DURATION_MS + u64::from(self.estimated_size) * UNIT_MS_PER_WORD,
        )
    }
}

/// Outcome of generating one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    Failed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Completed => f.write_str("completed"),
            UnitStatus::Failed => f.write_str("failed"),
        }
    }
}

/// A generated (or failed) unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_number: u32,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub word_count: u32,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Calls made to the generator for this unit, retries included.
    #[serde(default)]
    pub attempts: u32,
}

impl UnitResult {
    pub fn is_completed(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Layered execution order derived from an outline.
///
/// Layers run sequentially; units inside a layer run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unit numbers per layer, ascending within each layer.
    pub layers: Vec<Vec<u32>>,
    /// Size of the largest layer.
    pub parallelism_factor: usize,
    /// Sum over layers of the slowest unit in that layer.
    pub estimated_total_duration_ms: u64,
    pub total_units: usize,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn estimated_total_duration(&self) -> Duration {
        Duration::from_millis(self.estimated_total_duration_ms)
    }
}

/// Bridge data between unit spawning and unit generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawningMetadata {
    pub plan: ExecutionPlan,
    /// One node identifier per spawned unit (`unit-generation-<n>`).
    pub node_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Source documents
// ---------------------------------------------------------------------------

/// Uploaded source material attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub name: String,
    pub media_type: String,
    /// Extracted text, kept in checkpoints.
    #[serde(default)]
    pub extracted_text: String,
    /// Base64 payload. Stripped from checkpoint snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// The record threaded through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub current_stage: Stage,
    pub status: SessionStatus,
    #[serde(default)]
    pub progress: Progress,
    /// Units declared by the outline stage.
    #[serde(default)]
    pub outline: Vec<WorkUnit>,
    /// Generated results, ordered by unit number.
    #[serde(default)]
    pub units: Vec<UnitResult>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawning_metadata: Option<SpawningMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub needs_retry: bool,
    #[serde(default)]
    pub documents: Vec<SourceDocument>,
    /// Stage outputs keyed by artifact name.
    #[serde(default)]
    pub artifacts: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// A fresh, active session positioned at the first stage.
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            current_stage: Stage::Conversation,
            status: SessionStatus::Active,
            progress: Progress::default(),
            outline: Vec::new(),
            units: Vec::new(),
            retry_count: 0,
            spawning_metadata: None,
            error: None,
            needs_retry: false,
            documents: Vec::new(),
            artifacts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Result for a unit, if one has been recorded.
    pub fn unit(&self, unit_number: u32) -> Option<&UnitResult> {
        self.units.iter().find(|u| u.unit_number == unit_number)
    }

    /// Insert or replace a unit result, keeping `units` ordered by number.
    pub fn record_unit(&mut self, result: UnitResult) {
        match self
            .units
            .binary_search_by_key(&result.unit_number, |u| u.unit_number)
        {
            Ok(idx) => self.units[idx] = result,
            Err(idx) => self.units.insert(idx, result),
        }
        self.progress.units_completed =
            self.units.iter().filter(|u| u.is_completed()).count() as u32;
    }
}

/// Fields merged into the state by a stage transition.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub outline: Option<Vec<WorkUnit>>,
    pub units: Option<Vec<UnitResult>>,
    pub spawning_metadata: Option<SpawningMetadata>,
    pub artifacts: BTreeMap<String, serde_json::Value>,
    pub error: Option<String>,
    pub needs_retry: Option<bool>,
}

impl StageUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.artifacts.insert(name.into(), value);
        self
    }
}
