//! Bounded retry with a fixed delay for a single chunk's remote call.
//!
//! The delay between attempts is constant. Every attempt and every delay is
//! raced against the run's [`CancelToken`], and each attempt can be bounded
//! by a per-attempt timeout that counts as an ordinary failure.
//!
//! Exhaustion is reported as [`ChunkError::RetryExhausted`], never as a
//! panic: the caller turns it into an empty contribution and the rest of
//! the document carries on. [`RetryExecutor::run_detailed`] keeps the last
//! [`ServiceError`] for callers that must escalate it instead.

use crate::config::ProcessConfig;
use crate::error::{ChunkError, ServiceError};
use crate::pipeline::cancel::CancelToken;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// A value produced by a successful attempt, with the attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why [`RetryExecutor::run_detailed`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure {
    Cancelled { attempts: u32 },
    Exhausted { attempts: u32, last: ServiceError },
}

impl RetryFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Cancelled { attempts }
            | RetryFailure::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_chunk_error(self, index: usize) -> ChunkError {
        match self {
            RetryFailure::Cancelled { attempts } => ChunkError::Cancelled { index, attempts },
            RetryFailure::Exhausted { attempts, last } => ChunkError::RetryExhausted {
                index,
                attempts,
                detail: last.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    delay: Duration,
    attempt_timeout: Option<Duration>,
}

impl RetryExecutor {
    /// `max_attempts` counts the first call; values below 1 are treated as 1.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
            .with_attempt_timeout(config.attempt_timeout())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number. Non-retryable service errors
    /// end the loop early but are still reported as exhaustion.
    pub async fn run<T, F, Fut>(
        &self,
        index: usize,
        cancel: &CancelToken,
        op: F,
    ) -> Result<Retried<T>, ChunkError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.run_detailed(index, cancel, op)
            .await
            .map_err(|failure| failure.into_chunk_error(index))
    }

    /// [`RetryExecutor::run`], keeping the last service error on exhaustion.
    pub async fn run_detailed<T, F, Fut>(
        &self,
        index: usize,
        cancel: &CancelToken,
        mut op: F,
    ) -> Result<Retried<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut last_err: Option<ServiceError> = None;
        let mut attempts = 0;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryFailure::Cancelled { attempts });
            }
            attempts = attempt;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryFailure::Cancelled { attempts });
                }
                r = self.bounded(op(attempt)) => r,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Chunk {}: succeeded on attempt {}", index, attempt);
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(
                        "Chunk {}: attempt {}/{} failed — {}",
                        index, attempt, self.max_attempts, e
                    );
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(RetryFailure::Cancelled { attempts });
                    }
                    _ = sleep(self.delay) => {}
                }
            }
        }

        // At least one attempt ran, so there is always a last error here.
        let Some(last) = last_err else {
            return Err(RetryFailure::Cancelled { attempts });
        };
        warn!("Chunk {}: retries exhausted after {} attempts — {}", index, attempts, last);
        Err(RetryFailure::Exhausted { attempts, last })
    }

    async fn bounded<T, Fut>(&self, fut: Fut) -> Result<T, ServiceError>
    where
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(ServiceError::Timeout {
                    operation: "remote call",
                    secs: limit.as_secs(),
                })),
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn http_err() -> ServiceError {
        ServiceError::Http {
            operation: "generate",
            reason: "connection reset".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let exec = RetryExecutor::new(3, Duration::from_millis(1));
        let token = CancelToken::new();

        let c = Arc::clone(&calls);
        let out = exec
            .run(0, &token, move |_| {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(http_err())
                    } else {
                        Ok("text")
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(out.value, "text");
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let exec = RetryExecutor::new(5, Duration::from_millis(1));
        let c = Arc::clone(&calls);
        let out = exec
            .run(4, &CancelToken::new(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ServiceError>(1) }
            })
            .await
            .unwrap();
        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_last_error() {
        let exec = RetryExecutor::new(3, Duration::from_millis(1));
        let err = exec
            .run(7, &CancelToken::new(), |_| async { Err::<(), _>(http_err()) })
            .await
            .unwrap_err();
        match err {
            ChunkError::RetryExhausted {
                index,
                attempts,
                detail,
            } => {
                assert_eq!(index, 7);
                assert_eq!(attempts, 3);
                assert!(detail.contains("connection reset"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn detailed_exhaustion_keeps_the_service_error() {
        let exec = RetryExecutor::new(2, Duration::from_millis(1));
        let failure = exec
            .run_detailed(0, &CancelToken::new(), |_| async { Err::<(), _>(http_err()) })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts(), 2);
        assert_eq!(
            failure,
            RetryFailure::Exhausted {
                attempts: 2,
                last: http_err()
            }
        );
    }

    #[tokio::test]
    async fn delay_is_fixed_between_attempts() {
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let exec = RetryExecutor::new(3, Duration::from_millis(60));
        let s = Arc::clone(&stamps);
        let _ = exec
            .run(0, &CancelToken::new(), move |_| {
                s.lock().unwrap().push(Instant::now());
                async { Err::<(), _>(http_err()) }
            })
            .await;
        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        let first_gap = stamps[1] - stamps[0];
        let second_gap = stamps[2] - stamps[1];
        assert!(first_gap >= Duration::from_millis(60), "{first_gap:?}");
        assert!(second_gap >= Duration::from_millis(60), "{second_gap:?}");
        // A doubling backoff would make the second gap ~120ms.
        assert!(
            second_gap < first_gap + Duration::from_millis(45),
            "{first_gap:?} then {second_gap:?}"
        );
    }

    #[tokio::test]
    async fn unsupported_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let exec = RetryExecutor::new(4, Duration::from_millis(1));
        let c = Arc::clone(&calls);
        let err = exec
            .run(0, &CancelToken::new(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ServiceError::Unsupported {
                        operation: "generate_with_cache",
                        backend: "test".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ChunkError::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_failure() {
        let exec = RetryExecutor::new(2, Duration::from_millis(1))
            .with_attempt_timeout(Some(Duration::from_millis(10)));
        let err = exec
            .run(0, &CancelToken::new(), |_| async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, ServiceError>(())
            })
            .await
            .unwrap_err();
        match err {
            ChunkError::RetryExhausted { attempts, detail, .. } => {
                assert_eq!(attempts, 2);
                assert!(detail.contains("timed out"), "{detail}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_delay() {
        let exec = RetryExecutor::new(10, Duration::from_secs(30));
        let token = CancelToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };
        let start = Instant::now();
        let err = exec
            .run(3, &token, |_| async { Err::<(), _>(http_err()) })
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(
            err,
            ChunkError::Cancelled {
                index: 3,
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempt() {
        let token = CancelToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = RetryExecutor::new(3, Duration::ZERO)
            .run(0, &token, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ServiceError>(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, ChunkError::Cancelled { attempts: 0, .. }));
    }
}
