//! Exponential backoff with jitter for fallible async operations.
//!
//! Every external call made by a stage node goes through [`with_retry`].
//! The delay before retry `n` is `min(initial * multiplier^(n-1), max)`,
//! jittered uniformly within +/-25% so concurrent callers spread out.

use std::future::Future;
use std::time::Duration;

use folio_types::context::ErrorContext;
use folio_types::error::{ErrorCode, StructuredError};
use folio_types::retry::{RetryPolicy, RetryStats};
use rand::Rng;

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.75;

/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.25;

/// Information handed to the `on_retry` callback before each sleep.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// 1-based retry number (the first call is not a retry).
    pub retry: u32,
    pub delay: Duration,
    pub error: &'a StructuredError,
}

/// Optional hooks for a single `with_retry` call site.
#[derive(Default, Clone, Copy)]
pub struct RetryOptions<'a> {
    pub on_retry: Option<&'a (dyn Fn(&RetryAttempt<'_>) + Send + Sync)>,
    /// Overrides the default retryability check.
    pub should_retry: Option<&'a (dyn Fn(&StructuredError) -> bool + Send + Sync)>,
    /// External tool behind the operation, named on timeout errors.
    pub tool: Option<&'a str>,
}

impl<'a> RetryOptions<'a> {
    pub fn on_retry(mut self, hook: &'a (dyn Fn(&RetryAttempt<'_>) + Send + Sync)) -> Self {
        self.on_retry = Some(hook);
        self
    }

    pub fn should_retry(mut self, predicate: &'a (dyn Fn(&StructuredError) -> bool + Send + Sync)) -> Self {
        self.should_retry = Some(predicate);
        self
    }

    pub fn tool(mut self, tool_name: &'a str) -> Self {
        self.tool = Some(tool_name);
        self
    }

    fn is_retryable(&self, error: &StructuredError) -> bool {
        match self.should_retry {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }
}

impl std::fmt::Debug for RetryOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("on_retry", &self.on_retry.is_some())
            .field("should_retry", &self.should_retry.is_some())
            .field("tool", &self.tool)
            .finish()
    }
}

/// Un-jittered delay before retry `retry` (1-based), capped at `max_delay`.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
    let scaled = policy.initial_delay.as_secs_f64() * policy.backoff_multiplier.powi(exponent);
    let capped = scaled.min(policy.max_delay.as_secs_f64()).max(0.0);
    Duration::from_secs_f64(capped)
}

/// Scale `delay` by a uniform factor in `[0.75, 1.25]`.
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
    delay.mul_f64(factor)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's `max_retries + 1` calls are used up.
///
/// Non-retryable errors are returned unchanged. Exhaustion returns a
/// `retry_exhausted` error whose cause is the last failure and whose
/// context and `retry` field carry the attempt statistics.
pub async fn with_retry<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    options: RetryOptions<'_>,
    mut op: F,
) -> Result<T, StructuredError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StructuredError>>,
{
    let max_attempts = policy.max_attempts();
    let mut delays_ms: Vec<u64> = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let outcome = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(timed_out(operation_name, options.tool, limit)),
            },
            None => op().await,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation = operation_name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !options.is_retryable(&error) {
            return Err(error);
        }

        if attempt >= max_attempts {
            tracing::warn!(
                operation = operation_name,
                attempts = attempt,
                error = %error,
                "retries exhausted"
            );
            return Err(exhausted(operation_name, attempt, delays_ms, error));
        }

        let delay = apply_jitter(backoff_delay(policy, attempt));
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        delays_ms.push(delay_ms);

        if let Some(hook) = options.on_retry {
            hook(&RetryAttempt {
                retry: attempt,
                delay,
                error: &error,
            });
        }

        tracing::warn!(
            operation = operation_name,
            attempt,
            delay_ms,
            error = %error,
            "operation failed, retrying"
        );

        drop(error);
        tokio::time::sleep(delay).await;
    }
}

/// Timeout of one attempt. The error only carries a tool kind when the
/// caller named the tool; the operation name always goes into context.
fn timed_out(operation_name: &str, tool: Option<&str>, limit: Duration) -> StructuredError {
    let message = format!("{operation_name} timed out after {}ms", limit.as_millis());
    let error = match tool {
        Some(tool_name) => StructuredError::tool(tool_name, ErrorCode::ToolTimeout, message),
        None => StructuredError::generic(ErrorCode::ToolTimeout, message),
    };
    let mut context = ErrorContext::new().with_operation(operation_name);
    if let Some(tool_name) = tool {
        context = context.with_tool(tool_name);
    }
    error
        .with_context(context)
        .with_context_field("timeoutMs", u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
}

fn exhausted(operation_name: &str, attempts: u32, delays_ms: Vec<u64>, last: StructuredError) -> StructuredError {
    let total_delay_ms: u64 = delays_ms.iter().sum();
    let stats = RetryStats {
        operation_name: operation_name.to_string(),
        attempts,
        total_delay_ms,
        delays_ms,
    };

    StructuredError::new(
        last.kind.clone(),
        ErrorCode::RetryExhausted,
        format!("{operation_name} failed after {attempts} attempts: {}", last.message),
    )
    .with_context(last.context.clone())
    .with_context_field("attempts", attempts)
    .with_context_field("totalDelay", total_delay_ms)
    .with_context_field("operationName", operation_name)
    .with_retry_stats(stats)
    .with_cause(last)
}
