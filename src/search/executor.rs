//! Single-query execution with timeout and retry
//!
//! The executor never fails: every path through [`SearchExecutor::execute`]
//! ends in an [`ExecutedSearch`] carrying a terminal [`SearchOutcome`].

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CancelReason, ErrorKind, ExecutedSearch, Query, SearchCapability, SearchFailure, SearchOutcome,
};
use crate::config::RetryPolicy;

/// Runs one query against a [`SearchCapability`]
#[derive(Clone)]
pub struct SearchExecutor {
    capability: Arc<dyn SearchCapability>,
    retry: RetryPolicy,
}

impl SearchExecutor {
    pub fn new(capability: Arc<dyn SearchCapability>, retry: RetryPolicy) -> Self {
        Self { capability, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute `query`, bounding each call by `timeout` and retrying transient
    /// failures according to the retry policy.
    ///
    /// If `cancel` fires, the in-flight call is dropped and the outcome is
    /// `Cancelled`. The reason is reported as [`CancelReason::Aborted`]; callers
    /// that know the actual cause replace it.
    pub async fn execute(
        &self,
        query: &Query,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutedSearch {
        self.execute_counted(query, timeout, cancel, &AtomicUsize::new(0)).await
    }

    /// Like [`SearchExecutor::execute`], also publishing the number of calls
    /// made so far to `counter`. The count stays readable when an outer
    /// deadline drops this future mid-retry.
    pub async fn execute_counted(
        &self,
        query: &Query,
        timeout: Duration,
        cancel: &CancellationToken,
        counter: &AtomicUsize,
    ) -> ExecutedSearch {
        let provider = self.capability.name();
        let mut attempts = 0;
        let mut retries = 0;

        loop {
            if cancel.is_cancelled() {
                return ExecutedSearch::cancelled_after(query, attempts);
            }
            attempts += 1;
            counter.store(attempts, Ordering::Relaxed);
            debug!(query_id = query.id, attempt = attempts, provider, "Dispatching search");

            let call = AssertUnwindSafe(tokio::time::timeout(
                timeout,
                self.capability.search(&query.text, timeout),
            ))
            .catch_unwind();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return ExecutedSearch::cancelled_after(query, attempts);
                }
                result = call => result,
            };

            let failure = match result {
                Ok(Ok(Ok(payload))) => {
                    return ExecutedSearch::new(query, SearchOutcome::Success { payload }, attempts);
                }
                Ok(Ok(Err(failure))) => failure,
                Ok(Err(_elapsed)) => SearchFailure::new(
                    ErrorKind::Timeout,
                    format!("no response after {:.1} seconds", timeout.as_secs_f64()),
                ),
                Err(panic) => {
                    let message = format!("search provider panicked: {}", panic_message(&*panic));
                    warn!(query_id = query.id, provider, %message, "Search call panicked");
                    return ExecutedSearch::new(
                        query,
                        SearchOutcome::Error {
                            kind: ErrorKind::Internal,
                            message,
                        },
                        attempts,
                    );
                }
            };

            if !failure.kind.is_transient() {
                debug!(query_id = query.id, kind = %failure.kind, "Permanent search failure");
                return ExecutedSearch::new(query, terminal_outcome(failure, timeout), attempts);
            }

            if !self.retry.should_retry(retries) {
                warn!(
                    query_id = query.id,
                    attempts,
                    kind = %failure.kind,
                    "Search failed after exhausting retries"
                );
                return ExecutedSearch::new(query, terminal_outcome(failure, timeout), attempts);
            }

            let delay = self.retry.delay_for_attempt(retries);
            retries += 1;
            warn!(
                query_id = query.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Transient search failure, will retry"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return ExecutedSearch::cancelled_after(query, attempts);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl ExecutedSearch {
    fn cancelled_after(query: &Query, attempts: usize) -> Self {
        Self::new(
            query,
            SearchOutcome::Cancelled {
                reason: CancelReason::Aborted,
            },
            attempts,
        )
    }
}

fn terminal_outcome(failure: SearchFailure, timeout: Duration) -> SearchOutcome {
    match failure.kind {
        ErrorKind::Timeout => SearchOutcome::Timeout { after: timeout },
        kind => SearchOutcome::Error {
            kind,
            message: failure.message,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
