//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `folio-core` using sqlx with split
//! read/write pools. Session state and checkpoint snapshots are stored as
//! JSON blobs; unit results get one row per unit so they can be listed
//! without decoding whole sessions.

use chrono::{DateTime, SecondsFormat, Utc};
use folio_core::repository::workflow::WorkflowRepository;
use folio_types::checkpoint::{Checkpoint, SessionSummary};
use folio_types::error::RepositoryError;
use folio_types::workflow::{SessionStatus, Stage, UnitResult, UnitStatus, WorkflowState};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SessionRow {
    id: String,
    current_stage: String,
    status: String,
    overall_progress: i64,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            current_stage: row.try_get("current_stage")?,
            status: row.try_get("status")?,
            overall_progress: row.try_get("overall_progress")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_summary(self) -> Result<SessionSummary, RepositoryError> {
        let current_stage: Stage = self.current_stage.parse().map_err(RepositoryError::Query)?;
        let status: SessionStatus = self.status.parse().map_err(RepositoryError::Query)?;

        Ok(SessionSummary {
            session_id: self.id,
            current_stage,
            status,
            overall_progress: u8::try_from(self.overall_progress.clamp(0, 100)).unwrap_or(100),
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct UnitRow {
    unit_number: i64,
    title: String,
    content: String,
    word_count: i64,
    status: String,
    error: Option<String>,
    attempts: i64,
}

impl UnitRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            unit_number: row.try_get("unit_number")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            word_count: row.try_get("word_count")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
        })
    }

    fn into_result(self) -> Result<UnitResult, RepositoryError> {
        let status: UnitStatus = serde_json::from_value(serde_json::Value::String(self.status.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid unit status: {}", self.status)))?;

        Ok(UnitResult {
            unit_number: to_u32(self.unit_number, "unit_number")?,
            title: self.title,
            content: self.content,
            word_count: to_u32(self.word_count, "word_count")?,
            status,
            error: self.error,
            attempts: to_u32(self.attempts, "attempts")?,
        })
    }
}

struct CheckpointRow {
    session_id: String,
    node_name: String,
    timestamp: String,
    state_snapshot: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            session_id: row.try_get("session_id")?,
            node_name: row.try_get("node_name")?,
            timestamp: row.try_get("timestamp")?,
            state_snapshot: row.try_get("state_snapshot")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let state_snapshot = serde_json::from_str(&self.state_snapshot)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint snapshot JSON: {e}")))?;

        Ok(Checkpoint {
            session_id: self.session_id,
            node_name: self.node_name,
            timestamp: parse_datetime(&self.timestamp)?,
            state_snapshot,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_u32(value: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("{column} out of range: {value}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_session(&self, state: &WorkflowState) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| RepositoryError::Query(format!("serialize session: {e}")))?;

        sqlx::query(
            r#"INSERT INTO sessions (id, current_stage, status, overall_progress, state, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 current_stage = excluded.current_stage,
                 status = excluded.status,
                 overall_progress = excluded.overall_progress,
                 state = excluded.state,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&state.session_id)
        .bind(state.current_stage.as_str())
        .bind(state.status.to_string())
        .bind(i64::from(state.progress.overall_progress))
        .bind(&state_json)
        .bind(format_datetime(&state.created_at))
        .bind(format_datetime(&state.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let state: String = row.try_get("state").map_err(query_error)?;
                let state = serde_json::from_str(&state)
                    .map_err(|e| RepositoryError::Query(format!("invalid session JSON: {e}")))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn list_sessions(&self, limit: Option<i64>) -> Result<Vec<SessionSummary>, RepositoryError> {
        // SQLite treats a negative LIMIT as "no limit".
        let rows = sqlx::query(
            r#"SELECT id, current_stage, status, overall_progress, created_at, updated_at
               FROM sessions
               ORDER BY updated_at DESC
               LIMIT ?"#,
        )
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| SessionRow::from_row(row).map_err(query_error)?.into_summary())
            .collect()
    }

    async fn save_unit_result(&self, session_id: &str, result: &UnitResult) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO unit_results (session_id, unit_number, title, content, word_count, status, error, attempts, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(session_id, unit_number) DO UPDATE SET
                 title = excluded.title,
                 content = excluded.content,
                 word_count = excluded.word_count,
                 status = excluded.status,
                 error = excluded.error,
                 attempts = excluded.attempts,
                 updated_at = excluded.updated_at"#,
        )
        .bind(session_id)
        .bind(i64::from(result.unit_number))
        .bind(&result.title)
        .bind(&result.content)
        .bind(i64::from(result.word_count))
        .bind(result.status.to_string())
        .bind(&result.error)
        .bind(i64::from(result.attempts))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_unit_results(&self, session_id: &str) -> Result<Vec<UnitResult>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT unit_number, title, content, word_count, status, error, attempts
               FROM unit_results
               WHERE session_id = ?
               ORDER BY unit_number ASC"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| UnitRow::from_row(row).map_err(query_error)?.into_result())
            .collect()
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_string(&checkpoint.state_snapshot)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot: {e}")))?;

        sqlx::query(
            r#"INSERT INTO checkpoints (session_id, node_name, timestamp, state_snapshot)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(&checkpoint.session_id)
        .bind(&checkpoint.node_name)
        .bind(format_datetime(&checkpoint.timestamp))
        .bind(&snapshot)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT session_id, node_name, timestamp, state_snapshot
               FROM checkpoints
               WHERE session_id = ?
               ORDER BY timestamp DESC, seq DESC
               LIMIT 1"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(
                CheckpointRow::from_row(&row).map_err(query_error)?.into_checkpoint()?,
            )),
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT session_id, node_name, timestamp, state_snapshot
               FROM checkpoints
               WHERE session_id = ?
               ORDER BY timestamp ASC, seq ASC"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| CheckpointRow::from_row(row).map_err(query_error)?.into_checkpoint())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn test_repo() -> SqliteWorkflowRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteWorkflowRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn sample_unit(n: u32, status: UnitStatus) -> UnitResult {
        UnitResult {
            unit_number: n,
            title: format!("Chapter {n}"),
            content: format!("content of chapter {n}"),
            word_count: 4,
            status,
            error: (status == UnitStatus::Failed).then(|| "upstream returned 503".to_string()),
            attempts: 2,
        }
    }

    fn checkpoint(session: &str, node: &str, timestamp: DateTime<Utc>) -> Checkpoint {
        Checkpoint {
            session_id: session.to_string(),
            node_name: node.to_string(),
            timestamp,
            state_snapshot: json!({"node": node}),
        }
    }

    #[tokio::test]
    async fn test_save_and_get_session() {
        let repo = test_repo().await;
        let mut state = WorkflowState::new("s1");
        state.current_stage = Stage::Outline;
        state.progress.overall_progress = 5;
        repo.save_session(&state).await.unwrap();

        let loaded = repo.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(repo.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_session_upsert() {
        let repo = test_repo().await;
        let mut state = WorkflowState::new("s1");
        repo.save_session(&state).await.unwrap();

        state.current_stage = Stage::UnitSpawning;
        state.status = SessionStatus::Paused;
        state.updated_at = state.updated_at + Duration::seconds(1);
        repo.save_session(&state).await.unwrap();

        let sessions = repo.list_sessions(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].current_stage, Stage::UnitSpawning);
        assert_eq!(sessions[0].status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn test_list_sessions_newest_first_with_limit() {
        let repo = test_repo().await;
        let base = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let mut state = WorkflowState::new(*id);
            state.updated_at = base + Duration::seconds(i64::try_from(i).unwrap());
            repo.save_session(&state).await.unwrap();
        }

        let ids: Vec<String> = repo
            .list_sessions(Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(repo.list_sessions(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unit_results_upsert_and_order() {
        let repo = test_repo().await;
        repo.save_unit_result("s1", &sample_unit(2, UnitStatus::Failed)).await.unwrap();
        repo.save_unit_result("s1", &sample_unit(1, UnitStatus::Completed)).await.unwrap();
        repo.save_unit_result("s1", &sample_unit(2, UnitStatus::Completed)).await.unwrap();

        let units = repo.list_unit_results("s1").await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].unit_number, 1);
        assert!(units[1].is_completed());
        assert!(units[1].error.is_none());
        assert!(repo.list_unit_results("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_checkpoint_by_timestamp() {
        let repo = test_repo().await;
        let now = Utc::now();
        repo.append_checkpoint(&checkpoint("s1", "outline", now + Duration::seconds(5)))
            .await
            .unwrap();
        repo.append_checkpoint(&checkpoint("s1", "conversation", now)).await.unwrap();

        let latest = repo.latest_checkpoint("s1").await.unwrap().unwrap();
        assert_eq!(latest.node_name, "outline");

        let history: Vec<String> = repo
            .list_checkpoints("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.node_name)
            .collect();
        assert_eq!(history, vec!["conversation", "outline"]);
    }

    #[tokio::test]
    async fn test_latest_checkpoint_ties_use_insertion_order() {
        let repo = test_repo().await;
        let now = Utc::now();
        repo.append_checkpoint(&checkpoint("s1", "outline", now)).await.unwrap();
        repo.append_checkpoint(&checkpoint("s1", "unit_spawning", now)).await.unwrap();

        let latest = repo.latest_checkpoint("s1").await.unwrap().unwrap();
        assert_eq!(latest.node_name, "unit_spawning");
        assert_eq!(latest.state_snapshot["node"], "unit_spawning");
        assert!(repo.latest_checkpoint("s2").await.unwrap().is_none());
    }
}
