//! Scoped error context store.
//!
//! Holds a process-wide default context plus a stack of context frames per
//! scope key (a session id, or `session/unit-N` inside parallel layers).
//! Errors raised inside a scope are enriched with the merged frames. Scopes
//! are entered through [`ErrorContextStore::scope`]; each guard removes only
//! its own frame when dropped, so overlapping operations on one key can
//! finish in any order and context never outlives the operation that set it.

use std::future::Future;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use folio_types::context::ErrorContext;
use folio_types::error::StructuredError;

/// One `scope()` entry, tagged with the token of the guard that owns it.
#[derive(Debug, Clone)]
struct Frame {
    token: u64,
    context: ErrorContext,
}

/// Process-wide registry of scoped diagnostic context.
#[derive(Debug, Default)]
pub struct ErrorContextStore {
    default: RwLock<ErrorContext>,
    scopes: DashMap<String, Vec<Frame>>,
    next_token: AtomicU64,
}

/// Pops its own frame from the scope on drop.
#[must_use = "the scope is cleared as soon as the guard is dropped"]
pub struct ContextGuard<'a> {
    store: &'a ErrorContextStore,
    key: String,
    token: u64,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut frames) = self.store.scopes.get_mut(&self.key) {
            frames.retain(|frame| frame.token != self.token);
        }
        self.store.scopes.remove_if(&self.key, |_, frames| frames.is_empty());
    }
}

impl ErrorContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(context: ErrorContext) -> Self {
        Self {
            default: RwLock::new(context),
            ..Self::default()
        }
    }

    /// Replace the process-wide default context.
    pub fn set_default(&self, context: ErrorContext) {
        match self.default.write() {
            Ok(mut guard) => *guard = context,
            Err(poisoned) => *poisoned.into_inner() = context,
        }
    }

    fn default_context(&self) -> ErrorContext {
        match self.default.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Default context merged with the scope's frames in entry order (later wins).
    pub fn get_context(&self, scope: &str) -> ErrorContext {
        let default = self.default_context();
        match self.scopes.get(scope) {
            Some(frames) => frames
                .iter()
                .fold(default, |acc, frame| acc.merged_with(&frame.context)),
            None => default,
        }
    }

    /// Push `context` onto the scope until the guard drops.
    pub fn scope(&self, key: impl Into<String>, context: ErrorContext) -> ContextGuard<'_> {
        let key = key.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.scopes
            .entry(key.clone())
            .or_default()
            .push(Frame { token, context });
        ContextGuard {
            store: self,
            key,
            token,
        }
    }

    /// Number of scope keys currently holding at least one frame.
    pub fn active_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Rebuild `error` with `old context + scope context + extra`.
    ///
    /// Identity, kind, code, timestamp and cause are preserved.
    pub fn enrich(&self, error: StructuredError, scope: &str, extra: ErrorContext) -> StructuredError {
        let context = error
            .context
            .merged_with(&self.get_context(scope))
            .merged_with(&extra);
        error.rebuilt_with_context(context)
    }

    /// Wrap a foreign error into the generic kind and enrich it.
    pub fn enrich_plain<E>(&self, error: E, scope: &str, extra: ErrorContext) -> StructuredError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.enrich(StructuredError::wrap(error), scope, extra)
    }

    /// Run an external tool call under `scope`, timing it and enriching failures.
    pub async fn execute_with_tool_context<T, Fut>(
        &self,
        scope: &str,
        tool_name: &str,
        operation: &str,
        call: Fut,
    ) -> Result<T, StructuredError>
    where
        Fut: Future<Output = Result<T, StructuredError>>,
    {
        let mut context = ErrorContext::new().with_tool(tool_name).with_operation(operation);
        context.timestamp = Some(Utc::now());
        self.run_scoped(scope, context, call).await
    }

    /// Run a persistent-store call under `scope`, timing it and enriching failures.
    pub async fn execute_with_store_context<T, Fut>(
        &self,
        scope: &str,
        operation: &str,
        table: &str,
        call: Fut,
    ) -> Result<T, StructuredError>
    where
        Fut: Future<Output = Result<T, StructuredError>>,
    {
        let mut context = ErrorContext::new().with_operation(operation).with_extra("table", table);
        context.timestamp = Some(Utc::now());
        self.run_scoped(scope, context, call).await
    }

    async fn run_scoped<T, Fut>(&self, scope: &str, context: ErrorContext, call: Fut) -> Result<T, StructuredError>
    where
        Fut: Future<Output = Result<T, StructuredError>>,
    {
        let operation = context.operation.clone().unwrap_or_default();
        let _guard = self.scope(scope, context);
        let started = Instant::now();

        let result = call.await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(value) => {
                tracing::debug!(scope, operation = %operation, duration_ms, "operation completed");
                Ok(value)
            }
            Err(error) => {
                let enriched = self.enrich(error, scope, ErrorContext::new().with_extra("durationMs", duration_ms));
                tracing::debug!(
                    scope,
                    operation = %operation,
                    duration_ms,
                    error = %enriched,
                    "operation failed"
                );
                Err(enriched)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_types::error::{ErrorCode, ErrorKind};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn get_context_merges_default_under_scope() {
        let store = ErrorContextStore::with_default(ErrorContext::new().with_request_id("proc").with_stage("none"));
        let _guard = store.scope("s1", ErrorContext::for_session("s1").with_stage("outline"));

        let ctx = store.get_context("s1");
        assert_eq!(ctx.session_id.as_deref(), Some("s1"));
        assert_eq!(ctx.stage.as_deref(), Some("outline"));
        assert_eq!(ctx.request_id.as_deref(), Some("proc"));

        let other = store.get_context("s2");
        assert_eq!(other.session_id, None);
        assert_eq!(other.stage.as_deref(), Some("none"));
    }

    #[test]
    fn nested_guards_pop_their_own_frames() {
        let store = ErrorContextStore::new();
        {
            let _outer = store.scope("s1", ErrorContext::for_session("s1").with_stage("outline"));
            {
                let _inner = store.scope("s1", ErrorContext::new().with_tool("writer"));
                let ctx = store.get_context("s1");
                assert_eq!(ctx.tool_name.as_deref(), Some("writer"));
                assert_eq!(ctx.stage.as_deref(), Some("outline"));
            }
            let ctx = store.get_context("s1");
            assert_eq!(ctx.tool_name, None);
            assert_eq!(ctx.stage.as_deref(), Some("outline"));
        }
        assert_eq!(store.active_scopes(), 0);
    }

    #[test]
    fn scope_is_cleared_when_a_panic_unwinds() {
        let store = ErrorContextStore::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.scope("s1", ErrorContext::for_session("s1"));
            panic!("node exploded");
        }));
        assert!(result.is_err());
        assert_eq!(store.active_scopes(), 0);
    }

    #[test]
    fn enrich_preserves_identity_and_layers_context() {
        let store = ErrorContextStore::new();
        let _guard = store.scope("s1", ErrorContext::for_session("s1").with_stage("unit_generation"));

        let original = StructuredError::tool("writer", ErrorCode::ToolServer, "upstream 503")
            .with_context(ErrorContext::new().with_stage("outline").with_extra("unit", 3));
        let enriched = store.enrich(original.clone(), "s1", ErrorContext::new().with_extra("attempt", 2));

        assert_eq!(enriched.id, original.id);
        assert_eq!(enriched.occurred_at, original.occurred_at);
        assert_eq!(enriched.code, ErrorCode::ToolServer);
        assert_eq!(enriched.context.session_id.as_deref(), Some("s1"));
        assert_eq!(enriched.context.stage.as_deref(), Some("unit_generation"));
        assert_eq!(enriched.context.extra["unit"], 3);
        assert_eq!(enriched.context.extra["attempt"], 2);
    }

    #[test]
    fn enrich_plain_wraps_foreign_errors() {
        let store = ErrorContextStore::new();
        let _guard = store.scope("s1", ErrorContext::for_session("s1"));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "outline.json missing");

        let err = store.enrich_plain(io, "s1", ErrorContext::new());
        assert_eq!(err.kind, ErrorKind::Generic);
        assert_eq!(err.context.extra["originalError"], "outline.json missing");
        assert_eq!(err.context.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn tool_context_enriches_failures_and_clears_scope() {
        let store = ErrorContextStore::new();
        let _session = store.scope("s1", ErrorContext::for_session("s1"));

        let result: Result<(), _> = store
            .execute_with_tool_context("s1", "writer", "generate_unit", async {
                Err(StructuredError::tool("writer", ErrorCode::ToolRateLimit, "slow down"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.context.session_id.as_deref(), Some("s1"));
        assert_eq!(err.context.tool_name.as_deref(), Some("writer"));
        assert_eq!(err.context.operation.as_deref(), Some("generate_unit"));
        assert!(err.context.extra.contains_key("durationMs"));

        // Tool fields are gone, the enclosing session scope survives.
        let ctx = store.get_context("s1");
        assert_eq!(ctx.tool_name, None);
        assert_eq!(ctx.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn overlapping_tool_calls_on_one_session_leave_no_context_behind() {
        let store = ErrorContextStore::new();

        let writer = store.execute_with_tool_context("s1", "writer", "unit_1", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, StructuredError>(1)
        });
        let reviewer = async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            store
                .execute_with_tool_context("s1", "reviewer", "unit_2", async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err::<u32, _>(StructuredError::tool("reviewer", ErrorCode::ToolServer, "upstream 503"))
                })
                .await
        };

        let (writer, reviewer) = tokio::join!(writer, reviewer);
        assert_eq!(writer.unwrap(), 1);
        let err = reviewer.unwrap_err();
        assert_eq!(err.context.tool_name.as_deref(), Some("reviewer"));
        assert_eq!(err.context.operation.as_deref(), Some("unit_2"));

        assert_eq!(store.active_scopes(), 0);
        let ctx = store.get_context("s1");
        assert_eq!(ctx.tool_name, None);
        assert_eq!(ctx.operation, None);
    }

    #[test]
    fn guards_dropped_out_of_order_keep_the_remaining_frame() {
        let store = ErrorContextStore::new();
        let first = store.scope("s1", ErrorContext::new().with_tool("writer"));
        let second = store.scope("s1", ErrorContext::new().with_stage("unit_generation"));

        drop(first);
        let ctx = store.get_context("s1");
        assert_eq!(ctx.tool_name, None);
        assert_eq!(ctx.stage.as_deref(), Some("unit_generation"));
        assert_eq!(store.active_scopes(), 1);

        drop(second);
        assert_eq!(store.active_scopes(), 0);
    }

    #[tokio::test]
    async fn store_context_tags_table() {
        let store = ErrorContextStore::new();
        let result: Result<(), _> = store
            .execute_with_store_context("s1", "append_checkpoint", "checkpoints", async {
                Err(StructuredError::storage("append_checkpoint", "disk full"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.context.extra["table"], "checkpoints");
        assert_eq!(store.active_scopes(), 0);
    }

    #[tokio::test]
    async fn concurrent_scopes_are_isolated() {
        let store = Arc::new(ErrorContextStore::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let session = format!("session-{i}");
                let _guard = store.scope(
                    session.clone(),
                    ErrorContext::for_session(session.clone()).with_extra("worker", i),
                );
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    let ctx = store.get_context(&session);
                    assert_eq!(ctx.session_id.as_deref(), Some(session.as_str()));
                    assert_eq!(ctx.extra["worker"], i);
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.active_scopes(), 0);
    }
}
