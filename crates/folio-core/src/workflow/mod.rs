//! Workflow orchestration core: stages, planning, recovery and checkpoints.
//!
//! - `state_machine` -- legal stage transitions and weighted progress
//! - `planner` -- outline validation and Kahn layering into an execution plan
//! - `node` -- the `StageNode` contract and the recovery-aware `NodeRunner`
//! - `parallel` -- bounded-concurrency execution of one dependency layer
//! - `checkpoint` -- append-only snapshots for crash recovery
//! - `spawning` / `generation` -- the built-in unit stages
//! - `agent` -- the LLM-calling collaborator port
//! - `engine` -- drives a session through the pipeline

pub mod agent;
pub mod box_node;
pub mod checkpoint;
pub mod engine;
pub mod generation;
pub mod node;
pub mod parallel;
pub mod planner;
pub mod spawning;
pub mod state_machine;

pub use engine::{EngineError, WorkflowEngine};
