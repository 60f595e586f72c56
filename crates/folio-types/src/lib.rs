//! Shared domain types for Folio.
//!
//! This crate contains the types threaded through the orchestration engine:
//! workflow state, work units and execution plans, checkpoints, retry
//! policies, error context and the structured error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod retry;
pub mod workflow;
