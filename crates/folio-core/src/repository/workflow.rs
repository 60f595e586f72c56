//! Workflow repository trait definition.
//!
//! Defines the storage interface for sessions, generated unit results and
//! checkpoints. The infrastructure layer (folio-infra) implements this trait
//! with SQLite persistence; [`super::memory`] provides an in-memory version.

use folio_types::checkpoint::{Checkpoint, SessionSummary};
use folio_types::error::RepositoryError;
use folio_types::workflow::{UnitResult, WorkflowState};

/// Repository trait for workflow persistence.
///
/// Covers three record families, all keyed by session id:
/// - **Sessions:** the latest `WorkflowState` per session (upsert).
/// - **Unit results:** one row per `(session, unit_number)` (upsert).
/// - **Checkpoints:** append-only snapshots per `(session, node_name)`.
///
/// Implementations must give read-after-write consistency within a
/// session's checkpoint history.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Insert or replace the session row.
    fn save_session(
        &self,
        state: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get the stored state for a session.
    fn get_session(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowState>, RepositoryError>> + Send;

    /// List sessions, most recently updated first.
    fn list_sessions(
        &self,
        limit: Option<i64>,
    ) -> impl std::future::Future<Output = Result<Vec<SessionSummary>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Unit results
    // -----------------------------------------------------------------------

    /// Insert or replace a unit result.
    fn save_unit_result(
        &self,
        session_id: &str,
        result: &UnitResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All unit results for a session, ordered by unit number.
    fn list_unit_results(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<UnitResult>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Append a checkpoint. Existing checkpoints are never updated.
    fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Most recent checkpoint by timestamp; insertion order breaks ties.
    fn latest_checkpoint(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Every checkpoint for a session, oldest first.
    fn list_checkpoints(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;
}
