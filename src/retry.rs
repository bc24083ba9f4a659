//! Bounded retry with exponential backoff
//!
//! Every attempt races the operation against a timeout and against the
//! caller's cancellation token. Backoff sleeps are cancellable too, so
//! `stop()` never has to wait out a pending delay.

#[cfg(test)]
mod proptests;

use crate::error::DeliveryError;
use futures::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered chunks between the retrying task and the consumer
const STREAM_BUFFER: usize = 32;

pub type RetryCallback = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;
pub type RetryPredicate = Arc<dyn Fn(&DeliveryError) -> bool + Send + Sync>;

/// A failed attempt that is about to be retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    /// 1-indexed attempt that just failed
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_delay: Duration,
    pub last_error: DeliveryError,
}

/// Terminal outcome of a retried operation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetryError {
    #[error("Failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: DeliveryError,
    },
    /// Not retryable: surfaced on the first occurrence
    #[error(transparent)]
    Rejected(DeliveryError),
    #[error("Cancelled")]
    Cancelled,
}

impl RetryError {
    pub fn last_error(&self) -> Option<&DeliveryError> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Rejected(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Retry policy
#[derive(Clone)]
pub struct RetryOptions {
    /// Total number of attempts, including the first
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Per-attempt timeout
    pub timeout: Duration,
    on_retry: Option<RetryCallback>,
    should_retry: Option<RetryPredicate>,
    cancel: CancellationToken,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            DEFAULT_INITIAL_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_BACKOFF_FACTOR,
            DEFAULT_TIMEOUT,
        )
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("timeout", &self.timeout)
            .field("on_retry", &self.on_retry.is_some())
            .field("should_retry", &self.should_retry.is_some())
            .finish_non_exhaustive()
    }
}

enum Step {
    Retry(Duration),
    GiveUp(RetryError),
}

impl RetryOptions {
    /// Policy with no callbacks and a fresh cancellation token
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_factor,
            timeout,
            on_retry: None,
            should_retry: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Called with every scheduled retry, before the backoff delay starts
    #[must_use]
    pub fn with_on_retry(mut self, callback: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Replaces the default classification (`DeliveryError::is_retryable`)
    #[must_use]
    pub fn with_should_retry(
        mut self,
        predicate: impl Fn(&DeliveryError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay after the `attempt`-th failure:
    /// `min(initial_delay * backoff_factor^(attempt - 1), max_delay)`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= max {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.max(0.0).round() as u64)
        }
    }

    fn after_failure(&self, attempt: u32, error: DeliveryError) -> Step {
        let retryable = match &self.should_retry {
            Some(predicate) => predicate(&error),
            None => error.is_retryable(),
        };
        if !retryable {
            tracing::debug!(attempt, error = %error, kind = ?error.kind, "Not retrying");
            return Step::GiveUp(RetryError::Rejected(error));
        }

        let max_attempts = self.max_attempts();
        if attempt >= max_attempts {
            tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
            return Step::GiveUp(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let mut delay = self.delay_for_attempt(attempt);
        if let Some(retry_after) = error.retry_after {
            delay = delay.max(retry_after).min(self.max_delay);
        }

        tracing::info!(
            attempt,
            max_attempts,
            delay_ms = %delay.as_millis(),
            error = %error,
            "Scheduling retry"
        );

        if let Some(callback) = &self.on_retry {
            callback(&RetryAttempt {
                attempt,
                max_attempts,
                next_delay: delay,
                last_error: error,
            });
        }
        Step::Retry(delay)
    }

    async fn backoff(&self, delay: Duration) -> Result<(), RetryError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts.
pub async fn with_retry<T, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeliveryError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            () = options.cancel.cancelled() => return Err(RetryError::Cancelled),
            result = tokio::time::timeout(options.timeout, operation()) => result,
        };

        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_elapsed) => DeliveryError::timeout(options.timeout),
        };

        match options.after_failure(attempt, error) {
            Step::Retry(delay) => options.backoff(delay).await?,
            Step::GiveUp(err) => return Err(err),
        }
    }
}

/// Retrying wrapper for chunked output.
///
/// The whole operation is restarted only while nothing has been yielded.
/// Once a chunk has reached the consumer, any later failure (including an
/// idle timeout between chunks) ends the stream with a `PartialStream`
/// rejection, since restarting would duplicate delivered content.
///
/// Dropping the returned stream stops the underlying operation.
pub fn with_streaming_retry<C, F, S>(
    mut operation: F,
    options: RetryOptions,
) -> ReceiverStream<Result<C, RetryError>>
where
    C: Send + 'static,
    F: FnMut() -> S + Send + 'static,
    S: Stream<Item = Result<C, DeliveryError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut stream = Box::pin(operation());
            let mut delivered = 0usize;

            let failure = loop {
                let next = tokio::select! {
                    biased;
                    () = options.cancel.cancelled() => {
                        let _ = tx.send(Err(RetryError::Cancelled)).await;
                        return;
                    }
                    next = tokio::time::timeout(options.timeout, stream.next()) => next,
                };

                match next {
                    Ok(None) => return,
                    Ok(Some(Ok(chunk))) => {
                        delivered += 1;
                        if tx.send(Ok(chunk)).await.is_err() {
                            tracing::debug!("Stream consumer dropped");
                            return;
                        }
                    }
                    Ok(Some(Err(e))) => break e,
                    Err(_elapsed) => break DeliveryError::timeout(options.timeout),
                }
            };

            if delivered > 0 {
                let err = DeliveryError::partial_stream(delivered, &failure);
                tracing::warn!(delivered, error = %failure, "Stream failed after partial output");
                let _ = tx.send(Err(RetryError::Rejected(err))).await;
                return;
            }

            match options.after_failure(attempt, failure) {
                Step::Retry(delay) => {
                    if let Err(err) = options.backoff(delay).await {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
                Step::GiveUp(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast_options(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            ..RetryOptions::default()
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, DeliveryError>(42) }
            },
            &fast_options(3),
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_delays() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&delays);
        let options = RetryOptions {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            ..RetryOptions::default()
        }
        .with_on_retry(move |attempt| recorded.lock().unwrap().push(attempt.next_delay));

        let start = tokio::time::Instant::now();
        let result: Result<(), _> =
            with_retry(|| async { Err(DeliveryError::network("unreachable")) }, &options).await;

        assert_eq!(
            *delays.lock().unwrap(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.kind, ErrorKind::Network);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::from_status(401, "bad token")) }
            },
            &fast_options(5),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Rejected(ref e)) if e.kind == ErrorKind::Client));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let calls = AtomicU32::new(0);
        let options = RetryOptions {
            timeout: Duration::from_millis(100),
            ..fast_options(2)
        };
        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            },
            &options,
        )
        .await;

        assert!(result.as_ref().is_err_and(RetryError::is_exhausted));
        assert_eq!(result.unwrap_err().last_error().unwrap().kind, ErrorKind::Network);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DeliveryError::server("502"))
                    } else {
                        Ok("done")
                    }
                }
            },
            &fast_options(3),
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_retry_after() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&delays);
        let options = RetryOptions {
            max_delay: Duration::from_secs(60),
            ..fast_options(2)
        }
        .with_on_retry(move |attempt| recorded.lock().unwrap().push(attempt.next_delay));

        let calls = AtomicU32::new(0);
        let result = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(DeliveryError::rate_limit("slow down")
                            .with_retry_after(Duration::from_secs(5)))
                    } else {
                        Ok(())
                    }
                }
            },
            &options,
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(*delays.lock().unwrap(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn test_should_retry_overrides_classification() {
        let calls = AtomicU32::new(0);
        let options = fast_options(3).with_should_retry(|_| false);
        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::network("down")) }
            },
            &options,
        )
        .await;

        assert!(matches!(result, Err(RetryError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let token = CancellationToken::new();
        let options = RetryOptions {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..fast_options(3)
        }
        .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let result: Result<(), _> =
            with_retry(|| async { Err(DeliveryError::network("down")) }, &options).await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(60));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_retries_before_first_chunk() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let stream = with_streaming_retry(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let items: Vec<Result<&'static str, DeliveryError>> = if n == 0 {
                    vec![Err(DeliveryError::network("connect failed"))]
                } else {
                    vec![Ok("a"), Ok("b")]
                };
                futures::stream::iter(items)
            },
            fast_options(3),
        );

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items, vec![Ok("a"), Ok("b")]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_streaming_failure_after_output_is_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let stream = with_streaming_retry(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                futures::stream::iter(vec![
                    Ok("partial"),
                    Err(DeliveryError::network("connection reset")),
                ])
            },
            fast_options(3),
        );

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("partial"));
        match &items[1] {
            Err(RetryError::Rejected(e)) => assert_eq!(e.kind, ErrorKind::PartialStream),
            other => panic!("expected partial stream failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_streaming_exhaustion() {
        let stream = with_streaming_retry(
            || futures::stream::iter(vec![Err::<(), _>(DeliveryError::server("503"))]),
            fast_options(2),
        );

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(RetryError::Exhausted { attempts: 2, .. })));
    }
}
