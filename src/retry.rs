//! Retry with cancellation
//!
//! `retry()` drives an async operation on its own tokio task, retrying
//! `MulticallError::Retryable` failures after a jittered wait. The returned
//! handle is a future for the final outcome and can be cancelled at any time:
//! cancellation settles the handle with `MulticallError::Cancelled` right away,
//! while an attempt already in flight is left to finish and its result dropped.

use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{MulticallError, Result};

// ============================================
// OPTIONS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    /// Retries allowed after the first attempt (`None` = unbounded)
    pub n: Option<u32>,
    /// Lower bound of the wait between attempts
    pub min_wait: Duration,
    /// Upper bound of the wait between attempts
    pub max_wait: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            n: None,
            min_wait: Duration::from_millis(2500),
            max_wait: Duration::from_millis(3500),
        }
    }
}

/// Uniform wait in `[min, max]` at millisecond resolution
fn random_wait(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

// ============================================
// RETRY BUDGET
// ============================================

/// What the attempt loop does after a failed attempt
#[derive(Debug, PartialEq, Eq)]
enum Next {
    RetryAfter(Duration),
    GiveUp(MulticallError),
}

/// Remaining retry budget of one `retry()` invocation
struct Budget {
    remaining: Option<u32>,
    options: RetryOptions,
}

impl Budget {
    fn new(options: RetryOptions) -> Self {
        Self {
            remaining: options.n,
            options,
        }
    }

    fn after_failure(&mut self, err: MulticallError) -> Next {
        if !err.is_retryable() {
            return Next::GiveUp(err);
        }
        match self.remaining.as_mut() {
            Some(0) => Next::GiveUp(err),
            Some(n) => {
                *n -= 1;
                Next::RetryAfter(random_wait(self.options.min_wait, self.options.max_wait))
            }
            None => Next::RetryAfter(random_wait(self.options.min_wait, self.options.max_wait)),
        }
    }
}

// ============================================
// COMPLETION
// ============================================

/// Single terminal transition shared by the attempt loop and `cancel()`.
/// Whoever takes the sender first settles the handle.
struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T> Completion<T> {
    fn finish(&self, outcome: Result<T>) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The receiver may already be gone; settling is what matters.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn is_completed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

trait Cancel: Send + Sync {
    fn cancel(&self) -> bool;
    fn is_completed(&self) -> bool;
}

impl<T: Send> Cancel for Completion<T> {
    fn cancel(&self) -> bool {
        self.finish(Err(MulticallError::Cancelled))
    }

    fn is_completed(&self) -> bool {
        Completion::is_completed(self)
    }
}

/// Type-erased cancel side of a `RetryHandle`
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<dyn Cancel>,
}

impl CancelHandle {
    /// Cancel the retry sequence. Returns `false` if it had already completed.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ============================================
// RETRY HANDLE
// ============================================

/// Outcome of a `retry()` call: await it for the result, or cancel it
pub struct RetryHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    canceller: CancelHandle,
}

impl<T> RetryHandle<T> {
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    pub fn canceller(&self) -> CancelHandle {
        self.canceller.clone()
    }
}

impl<T> Future for RetryHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(MulticallError::Fatal("retry task dropped".to_string())))
        })
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the retry
/// budget runs out. Exactly one attempt is in flight at a time.
///
/// Must be called from within a tokio runtime.
pub fn retry<F, Fut, T>(mut f: F, options: RetryOptions) -> RetryHandle<T>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let completion = Arc::new(Completion {
        tx: Mutex::new(Some(tx)),
    });
    let driver = completion.clone();

    tokio::spawn(async move {
        let mut budget = Budget::new(options);
        let mut attempt: u32 = 1;

        loop {
            let outcome = f().await;

            if driver.is_completed() {
                trace!(attempt, "retry cancelled, dropping attempt result");
                return;
            }

            let wait = match outcome {
                Ok(value) => {
                    driver.finish(Ok(value));
                    return;
                }
                Err(err) => match budget.after_failure(err) {
                    Next::GiveUp(err) => {
                        debug!(attempt, error = %err, "giving up");
                        driver.finish(Err(err));
                        return;
                    }
                    Next::RetryAfter(wait) => wait,
                },
            };

            debug!(attempt, wait_ms = wait.as_millis() as u64, "attempt failed, retrying");
            tokio::time::sleep(wait).await;

            if driver.is_completed() {
                return;
            }
            attempt += 1;
        }
    });

    RetryHandle {
        rx,
        canceller: CancelHandle { inner: completion },
    }
}

// ============================================
// TESTS
// ============================================
