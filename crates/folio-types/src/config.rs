//! Engine configuration types for Folio.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! recovery limits, layer concurrency and the default retry policy.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Upper bound on the layer concurrency ceiling.
pub const MAX_CONCURRENCY_LIMIT: usize = 16;

/// Top-level configuration for the orchestration engine.
///
/// Loaded from `~/.folio/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Node-level recovery attempts before `max_retries_exceeded`.
    #[serde(default = "default_max_recovery_retries")]
    pub max_recovery_retries: u32,

    /// Units generated concurrently within one dependency layer.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Artifacts larger than this (serialized bytes) are stripped from checkpoints.
    #[serde(default = "default_snapshot_field_limit")]
    pub snapshot_field_limit: usize,

    /// Capacity of the workflow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Policy applied to every external call made by built-in nodes.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_recovery_retries() -> u32 {
    2
}

fn default_concurrency_limit() -> usize {
    5
}

fn default_snapshot_field_limit() -> usize {
    262_144
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recovery_retries: default_max_recovery_retries(),
            concurrency_limit: default_concurrency_limit(),
            snapshot_field_limit: default_snapshot_field_limit(),
            event_capacity: default_event_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Concurrency ceiling clamped to `1..=MAX_CONCURRENCY_LIMIT`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency_limit.clamp(1, MAX_CONCURRENCY_LIMIT)
    }
}
