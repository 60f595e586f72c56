//! Orchestration engine and repository trait definitions for Folio.
//!
//! This crate holds the workflow engine (state machine, planner, node
//! framework, checkpointing), the retry subsystem, the error context store
//! and the "ports" (repository traits) that the infrastructure layer
//! implements. It depends only on `folio-types` -- never on `folio-infra`
//! or any database/IO crate.

pub mod error_context;
pub mod event;
pub mod metrics;
pub mod repository;
pub mod retry;
pub mod workflow;
