//! Persisted checkpoint and session record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{SessionStatus, Stage};

/// Immutable snapshot of a session written after a node completes.
///
/// Serialized shape:
/// `{ "sessionId": .., "nodeName": .., "timestamp": "<ISO-8601>", "stateSnapshot": {..} }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub session_id: String,
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
    /// Workflow state with large binary payloads stripped.
    pub state_snapshot: serde_json::Value,
}

/// Lightweight session row for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub current_stage: Stage,
    pub status: SessionStatus,
    pub overall_progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
