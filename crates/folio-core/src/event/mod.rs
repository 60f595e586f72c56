//! Event bus for workflow progress.
//!
//! `EventBus` fans `WorkflowEvent`s out over a `tokio::sync::broadcast`
//! channel; `SessionEvents` follows a single session.

pub mod bus;

pub use bus::{EventBus, SessionEvents};
