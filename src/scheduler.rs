//! Bounded-concurrency batch scheduling
//!
//! Runs a batch of queries through a [`SearchExecutor`]:
//!
//! ```text
//!  queries ──► [launch delay] ──► [semaphore: C permits] ──► execute (≤ T) ──┐
//!                                                                               │
//!  batch deadline B / abort / fatal provider error ──► cancel token ──► drain ◄┘
//! ```
//!
//! Every query comes back exactly once, in submission order, with a terminal
//! outcome. Cancelling the batch never discards results that already arrived.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerOptions;
use crate::search::{CancelReason, ErrorKind, ExecutedSearch, Query, SearchExecutor, SearchOutcome};

/// Dispatches batches of queries with bounded concurrency
#[derive(Clone)]
pub struct TaskScheduler {
    executor: SearchExecutor,
    call_timeout: Duration,
}

impl TaskScheduler {
    /// Create a scheduler. `call_timeout` bounds each individual capability call.
    pub fn new(executor: SearchExecutor, call_timeout: Duration) -> Self {
        Self {
            executor,
            call_timeout,
        }
    }

    /// Run `queries` and return one result per query, in submission order.
    pub async fn run(
        &self,
        queries: &[Query],
        options: &SchedulerOptions,
        abort: &CancellationToken,
    ) -> Vec<ExecutedSearch> {
        self.run_with_progress(queries, options, abort, None).await
    }

    /// Like [`TaskScheduler::run`], additionally forwarding each result over
    /// `progress` as soon as its task finishes.
    pub async fn run_with_progress(
        &self,
        queries: &[Query],
        options: &SchedulerOptions,
        abort: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ExecutedSearch>>,
    ) -> Vec<ExecutedSearch> {
        if queries.is_empty() {
            return Vec::new();
        }

        info!(
            queries = queries.len(),
            concurrency = options.concurrency,
            task_timeout_ms = options.task_timeout.as_millis() as u64,
            batch_timeout_ms = options.batch_timeout.as_millis() as u64,
            "Starting search batch"
        );

        let batch = abort.child_token();
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut slots = HashMap::with_capacity(queries.len());

        for (slot, query) in queries.iter().enumerate() {
            let task = SearchTask {
                executor: self.executor.clone(),
                query: query.clone(),
                semaphore: Arc::clone(&semaphore),
                token: batch.clone(),
                launch_delay: options.launch_delay.saturating_mul(slot.min(u32::MAX as usize) as u32),
                task_timeout: options.task_timeout,
                call_timeout: self.call_timeout,
            };
            let handle = set.spawn(task.run());
            slots.insert(handle.id(), slot);
        }

        let deadline = tokio::time::sleep(options.batch_timeout);
        tokio::pin!(deadline);

        let mut results: Vec<Option<ExecutedSearch>> = vec![None; queries.len()];
        let mut cancel_reason: Option<CancelReason> = None;

        loop {
            let joined = if cancel_reason.is_none() {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => {
                        warn!("Search batch aborted by caller");
                        cancel_reason = Some(CancelReason::Aborted);
                        batch.cancel();
                        continue;
                    }
                    _ = &mut deadline => {
                        warn!(
                            batch_timeout_ms = options.batch_timeout.as_millis() as u64,
                            "Search batch timed out, cancelling outstanding tasks"
                        );
                        cancel_reason = Some(CancelReason::BatchTimeout);
                        batch.cancel();
                        continue;
                    }
                    joined = set.join_next_with_id() => joined,
                }
            } else {
                set.join_next_with_id().await
            };

            let Some(joined) = joined else { break };

            let (slot, mut executed) = match joined {
                Ok((id, executed)) => match slots.get(&id) {
                    Some(&slot) => (slot, executed),
                    None => continue,
                },
                Err(err) => {
                    let Some(&slot) = slots.get(&err.id()) else { continue };
                    let query = &queries[slot];
                    let outcome = if err.is_cancelled() {
                        SearchOutcome::Cancelled {
                            reason: cancel_reason.unwrap_or(CancelReason::Aborted),
                        }
                    } else {
                        warn!(query_id = query.id, error = %err, "Search task died");
                        SearchOutcome::Error {
                            kind: ErrorKind::Internal,
                            message: format!("search task failed: {}", err),
                        }
                    };
                    (slot, ExecutedSearch::new(query, outcome, 0))
                }
            };

            if let (SearchOutcome::Cancelled { reason }, Some(cause)) =
                (&mut executed.outcome, cancel_reason)
            {
                *reason = cause;
            }

            if cancel_reason.is_none() && options.halt_on_fatal && executed.outcome.is_fatal_error() {
                warn!(
                    query_id = executed.query_id,
                    "Fatal search provider error, cancelling the rest of the batch"
                );
                cancel_reason = Some(CancelReason::ProviderHalted);
                batch.cancel();
            }

            debug!(
                query_id = executed.query_id,
                status = ?executed.status(),
                attempts = executed.attempts,
                "Search task finished"
            );

            if let Some(tx) = &progress {
                // A dropped receiver only means nobody is watching progress
                let _ = tx.send(executed.clone());
            }
            results[slot] = Some(executed);
        }

        let results: Vec<ExecutedSearch> = results
            .into_iter()
            .zip(queries)
            .map(|(result, query)| {
                result.unwrap_or_else(|| {
                    ExecutedSearch::cancelled(query, cancel_reason.unwrap_or(CancelReason::Aborted))
                })
            })
            .collect();

        info!(
            queries = results.len(),
            succeeded = results
                .iter()
                .filter(|r| matches!(r.outcome, SearchOutcome::Success { .. }))
                .count(),
            cancelled = ?cancel_reason,
            "Search batch finished"
        );

        results
    }
}

/// One spawned unit of work
struct SearchTask {
    executor: SearchExecutor,
    query: Query,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    launch_delay: Duration,
    task_timeout: Duration,
    call_timeout: Duration,
}

impl SearchTask {
    async fn run(self) -> ExecutedSearch {
        // The launch delay is served before competing for a slot
        if !self.launch_delay.is_zero() {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return self.cancelled(),
                _ = tokio::time::sleep(self.launch_delay) => {}
            }
        }

        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return self.cancelled(),
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.cancelled(),
            },
        };

        let attempts = AtomicUsize::new(0);
        let execution = self
            .executor
            .execute_counted(&self.query, self.call_timeout, &self.token, &attempts);

        match tokio::time::timeout(self.task_timeout, execution).await {
            Ok(executed) => executed,
            Err(_) => {
                let attempts = attempts.load(Ordering::Relaxed);
                warn!(
                    query_id = self.query.id,
                    attempts,
                    task_timeout_ms = self.task_timeout.as_millis() as u64,
                    "Search task timed out"
                );
                ExecutedSearch::new(
                    &self.query,
                    SearchOutcome::Timeout {
                        after: self.task_timeout,
                    },
                    attempts,
                )
            }
        }
    }

    fn cancelled(&self) -> ExecutedSearch {
        ExecutedSearch::cancelled(&self.query, CancelReason::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::search::{SearchCapability, SearchFailure, SearchStatus};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Capability whose behavior is keyed by query text; counts overlapping calls
    #[derive(Default)]
    struct Instrumented {
        latency: HashMap<String, Duration>,
        default_latency: Duration,
        hang: Vec<String>,
        fatal: Vec<String>,
        flaky: Vec<String>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
        starts: Mutex<Vec<(String, Instant)>>,
    }

    impl Instrumented {
        fn max_active(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }
    }

    struct ActiveGuard<'a>(&'a AtomicUsize);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SearchCapability for Instrumented {
        async fn search(&self, query: &str, _timeout: Duration) -> Result<Value, SearchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = ActiveGuard(&self.active);
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.starts.lock().unwrap().push((query.to_string(), Instant::now()));

            if self.fatal.iter().any(|q| q == query) {
                return Err(SearchFailure::invalid_credentials("bad key"));
            }
            if self.flaky.iter().any(|q| q == query) {
                return Err(SearchFailure::rate_limited("slow down"));
            }
            if self.hang.iter().any(|q| q == query) {
                futures::future::pending::<()>().await;
            }
            let wait = self.latency.get(query).copied().unwrap_or(self.default_latency);
            tokio::time::sleep(wait).await;
            Ok(json!(format!("results for {}", query)))
        }
    }

    fn queries(n: usize) -> Vec<Query> {
        (0..n).map(|i| Query::new(i, format!("q{}", i))).collect()
    }

    fn scheduler(cap: Arc<Instrumented>) -> TaskScheduler {
        let executor = SearchExecutor::new(cap, RetryPolicy::no_retry());
        TaskScheduler::new(executor, Duration::from_secs(30))
    }

    fn options(concurrency: usize) -> SchedulerOptions {
        SchedulerOptions::default()
            .with_concurrency(concurrency)
            .with_launch_delay(Duration::ZERO)
            .with_task_timeout(Duration::from_secs(60))
            .with_batch_timeout(Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_and_order() {
        // Later queries finish first, so completion order is reversed
        let latency = (0..10)
            .map(|i| (format!("q{}", i), Duration::from_millis(100 * (10 - i as u64))))
            .collect();
        let cap = Arc::new(Instrumented {
            latency,
            ..Default::default()
        });

        let results = scheduler(cap.clone())
            .run(&queries(10), &options(3), &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 10);
        let ids: Vec<usize> = results.iter().map(|r| r.query_id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert!(results.iter().all(|r| r.status() == SearchStatus::Success));
        assert!(cap.max_active() <= 3, "observed {} concurrent calls", cap.max_active());
        assert_eq!(cap.max_active(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_isolated_to_one_query() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_millis(200),
            hang: vec!["q4".into()],
            ..Default::default()
        });
        let opts = options(3).with_task_timeout(Duration::from_secs(5));

        let started = Instant::now();
        let results = scheduler(cap)
            .run(&queries(10), &opts, &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(results.len(), 10);
        for result in &results {
            if result.query_id == 4 {
                assert_eq!(
                    result.outcome,
                    SearchOutcome::Timeout {
                        after: Duration::from_secs(5)
                    }
                );
            } else {
                assert_eq!(result.status(), SearchStatus::Success);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_reports_attempts_made() {
        let cap = Arc::new(Instrumented {
            flaky: vec!["q0".into()],
            ..Default::default()
        });
        // Calls at 0s, 1s and 3s; the fourth would come at 7s
        let policy = RetryPolicy::new(5)
            .with_backoff_base(Duration::from_secs(1))
            .with_backoff_max(Duration::from_secs(10));
        let scheduler =
            TaskScheduler::new(SearchExecutor::new(cap.clone(), policy), Duration::from_secs(30));
        let opts = options(1).with_task_timeout(Duration::from_millis(3_500));

        let results = scheduler.run(&queries(1), &opts, &CancellationToken::new()).await;

        assert_eq!(
            results[0].outcome,
            SearchOutcome::Timeout {
                after: Duration::from_millis(3_500)
            }
        );
        assert_eq!(results[0].attempts, 3);
        assert_eq!(cap.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_keeps_completed_work() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_secs(10),
            ..Default::default()
        });
        let opts = options(1)
            .with_task_timeout(Duration::from_secs(20))
            .with_batch_timeout(Duration::from_secs(25));

        let results = scheduler(cap)
            .run(&queries(4), &opts, &CancellationToken::new())
            .await;

        let statuses: Vec<SearchStatus> = results.iter().map(|r| r.status()).collect();
        assert_eq!(
            statuses,
            vec![
                SearchStatus::Success,
                SearchStatus::Success,
                SearchStatus::Cancelled,
                SearchStatus::Cancelled
            ]
        );
        for result in &results[2..] {
            assert_eq!(
                result.outcome,
                SearchOutcome::Cancelled {
                    reason: CancelReason::BatchTimeout
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_signal_cancels_everything_outstanding() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_secs(10),
            ..Default::default()
        });
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let results = scheduler(cap).run(&queries(5), &options(2), &abort).await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.outcome
            == SearchOutcome::Cancelled {
                reason: CancelReason::Aborted
            }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_halts_batch() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_secs(1),
            fatal: vec!["q0".into()],
            ..Default::default()
        });

        let results = scheduler(cap.clone())
            .run(&queries(4), &options(1), &CancellationToken::new())
            .await;

        assert!(results[0].outcome.is_fatal_error());
        for result in &results[1..] {
            assert_eq!(
                result.outcome,
                SearchOutcome::Cancelled {
                    reason: CancelReason::ProviderHalted
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_without_halt_continues() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_millis(10),
            fatal: vec!["q0".into()],
            ..Default::default()
        });
        let opts = options(1).with_halt_on_fatal(false);

        let results = scheduler(cap)
            .run(&queries(3), &opts, &CancellationToken::new())
            .await;

        assert_eq!(results[0].status(), SearchStatus::Error);
        assert_eq!(results[1].status(), SearchStatus::Success);
        assert_eq!(results[2].status(), SearchStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_delay_does_not_hold_a_slot() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_secs(1),
            ..Default::default()
        });
        let opts = options(2).with_launch_delay(Duration::from_millis(100));

        let origin = Instant::now();
        scheduler(cap.clone())
            .run(&queries(3), &opts, &CancellationToken::new())
            .await;

        let starts = cap.starts.lock().unwrap().clone();
        let offset = |name: &str| {
            starts
                .iter()
                .find(|(q, _)| q == name)
                .map(|(_, at)| at.duration_since(origin))
                .unwrap()
        };
        assert_eq!(offset("q0"), Duration::ZERO);
        // q1 waited out its delay while q0 ran, without blocking it
        assert_eq!(offset("q1"), Duration::from_millis(100));
        // q2 became eligible at 200ms but both slots were busy until q0 finished
        assert_eq!(offset("q2"), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reports_every_completion() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_millis(50),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let results = scheduler(cap)
            .run_with_progress(&queries(6), &options(2), &CancellationToken::new(), Some(tx))
            .await;

        let mut seen = Vec::new();
        while let Ok(item) = rx.try_recv() {
            seen.push(item.query_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
        assert_eq!(results.len(), 6);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let cap = Arc::new(Instrumented::default());
        let results = scheduler(cap)
            .run(&[], &options(2), &CancellationToken::new())
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserves_non_contiguous_query_ids() {
        let cap = Arc::new(Instrumented {
            default_latency: Duration::from_millis(10),
            ..Default::default()
        });
        let batch = vec![Query::new(2, "q2"), Query::new(5, "q5"), Query::new(6, "q6")];

        let results = scheduler(cap)
            .run(&batch, &options(2), &CancellationToken::new())
            .await;

        let ids: Vec<usize> = results.iter().map(|r| r.query_id).collect();
        assert_eq!(ids, vec![2, 5, 6]);
    }
}
