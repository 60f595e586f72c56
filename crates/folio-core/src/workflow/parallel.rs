//! Bounded-concurrency execution of one dependency layer.
//!
//! Every unit of a layer is spawned onto a `JoinSet`; a semaphore caps how
//! many run at once. `run_layer` returns only after every unit resolved,
//! which makes each layer a barrier for the next. A failing unit never
//! cancels its siblings.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use folio_types::config::MAX_CONCURRENCY_LIMIT;
use folio_types::error::StructuredError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcomes of one layer, each list sorted by unit number.
#[derive(Debug)]
pub struct LayerOutcome<T> {
    pub succeeded: Vec<(u32, T)>,
    pub failed: Vec<(u32, StructuredError)>,
}

impl<T> LayerOutcome<T> {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs the units of a layer concurrently under a fixed ceiling.
#[derive(Debug, Clone)]
pub struct LayerExecutor {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl LayerExecutor {
    /// `limit` is clamped to `1..=MAX_CONCURRENCY_LIMIT`.
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(1, MAX_CONCURRENCY_LIMIT);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `task(unit)` for every unit and wait for all of them.
    pub async fn run_layer<T, F, Fut>(&self, units: &[u32], task: F) -> LayerOutcome<T>
    where
        T: Send + 'static,
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, StructuredError>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for &unit in units {
            let semaphore = Arc::clone(&self.semaphore);
            let work = task(unit);
            set.spawn(async move {
                // The semaphore is never closed, so acquisition only waits.
                let _permit = semaphore.acquire_owned().await.ok();
                (unit, work.await)
            });
        }

        let mut pending: BTreeSet<u32> = units.iter().copied().collect();
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((unit, Ok(value))) => {
                    pending.remove(&unit);
                    succeeded.push((unit, value));
                }
                Ok((unit, Err(error))) => {
                    pending.remove(&unit);
                    failed.push((unit, error));
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "unit task aborted");
                }
            }
        }

        // Tasks that panicked never reported back.
        for unit in pending {
            failed.push((
                unit,
                StructuredError::critical(format!("unit {unit} task terminated unexpectedly")),
            ));
        }

        succeeded.sort_by_key(|(unit, _)| *unit);
        failed.sort_by_key(|(unit, _)| *unit);
        LayerOutcome { succeeded, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_types::error::ErrorCode;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let executor = LayerExecutor::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcome = executor
            .run_layer(&[1, 2, 3, 4, 5, 6], |unit| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(unit * 10)
                }
            })
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(outcome.succeeded.len(), 6);
        assert_eq!(outcome.succeeded[0], (1, 10));
    }

    #[tokio::test]
    async fn partial_failure_keeps_siblings() {
        let executor = LayerExecutor::new(5);
        let outcome = executor
            .run_layer(&[3, 1, 2], |unit| async move {
                if unit == 2 {
                    Err(StructuredError::generic(ErrorCode::RetryExhausted, "unit 2 gave up"))
                } else {
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(unit))).await;
                    Ok(unit)
                }
            })
            .await;

        assert!(!outcome.is_complete_success());
        let ok: Vec<u32> = outcome.succeeded.iter().map(|(u, _)| *u).collect();
        assert_eq!(ok, vec![1, 3]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, 2);
    }

    #[tokio::test]
    async fn layers_run_as_barriers() {
        let executor = LayerExecutor::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        for layer in [vec![1, 2, 3], vec![4, 5]] {
            executor
                .run_layer(&layer, |unit| {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().unwrap().push(("start", unit));
                        tokio::time::sleep(Duration::from_millis(10 * u64::from(4 - unit.min(3)))).await;
                        log.lock().unwrap().push(("end", unit));
                        Ok(())
                    }
                })
                .await;
        }

        let log = log.lock().unwrap();
        let last_first_layer_end = log
            .iter()
            .rposition(|(kind, unit)| *kind == "end" && *unit <= 3)
            .unwrap();
        let first_second_layer_start = log
            .iter()
            .position(|(kind, unit)| *kind == "start" && *unit >= 4)
            .unwrap();
        assert!(last_first_layer_end < first_second_layer_start);
    }

    #[tokio::test]
    async fn panicking_unit_is_reported_as_failed() {
        let executor = LayerExecutor::new(2);
        let outcome = executor
            .run_layer(&[1, 2], |unit| async move {
                if unit == 1 {
                    panic!("generator bug");
                }
                Ok(unit)
            })
            .await;

        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.failed[0].0, 1);
        assert_eq!(outcome.failed[0].1.code, ErrorCode::CriticalWorkflow);
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(LayerExecutor::new(0).limit(), 1);
        assert_eq!(LayerExecutor::new(64).limit(), MAX_CONCURRENCY_LIMIT);
    }
}
