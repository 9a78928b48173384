//! Retry with exponential backoff and a per-attempt timeout around the hosted services.
//!
//! Lives outside the answerer and the index builder: they see one call that
//! either succeeds or fails.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RetryConfig;
use crate::provider::{EmbedError, Embedder, GenerateError, Generator};

/// Longest delay between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    /// One attempt, no timeout.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            timeout: None,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.saturating_sub(1).min(6) as u32;
        self.base_delay.saturating_mul(1 << capped).min(MAX_BACKOFF)
    }

    async fn run<T, E, F, Fut>(
        &self,
        op: &str,
        mut call: F,
        timed_out: impl Fn(Duration) -> E,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(r) => r,
                    Err(_) => Err(timed_out(limit)),
                },
                None => call().await,
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts && retryable(&e) => {
                    let delay = self.backoff(attempt);
                    warn!(op, attempt, ?delay, "retrying after error: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            timeout: (c.timeout_secs > 0).then(|| Duration::from_secs(c.timeout_secs)),
        }
    }
}

/// Wraps an [Embedder] or [Generator] with a [RetryPolicy].
#[derive(Debug, Clone)]
pub struct Resilient<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Resilient<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Embedder> Embedder for Resilient<T> {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.policy
            .run("embed", || self.inner.embed(texts), EmbedError::Timeout, EmbedError::is_retryable)
            .await
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[async_trait]
impl<T: Generator> Generator for Resilient<T> {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        self.policy
            .run(
                "generate",
                || self.inner.generate(prompt),
                GenerateError::Timeout,
                GenerateError::is_retryable,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Fails with the queued errors first, then answers "ok".
    struct Flaky {
        calls: AtomicUsize,
        errors: Mutex<Vec<GenerateError>>,
    }

    impl Flaky {
        fn new(errors: Vec<GenerateError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                errors: Mutex::new(errors),
            }
        }
    }

    #[async_trait]
    impl Generator for Flaky {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut errors = self.errors.lock().unwrap();
                if errors.is_empty() {
                    None
                } else {
                    Some(errors.remove(0))
                }
            };
            match next {
                Some(e) => Err(e),
                None => Ok("ok".to_string()),
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl Generator for Hangs {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".to_string())
        }
    }

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            timeout: None,
        }
    }

    fn unavailable() -> GenerateError {
        GenerateError::Status {
            status: 503,
            body: "busy".into(),
        }
    }

    #[tokio::test]
    async fn retries_retryable_errors() {
        let g = Resilient::new(Flaky::new(vec![unavailable(), unavailable()]), policy(3));
        assert_eq!(g.generate("p").await.unwrap(), "ok");
        assert_eq!(g.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let g = Resilient::new(Flaky::new(vec![unavailable(), unavailable()]), policy(2));
        assert!(matches!(g.generate("p").await, Err(GenerateError::Status { status: 503, .. })));
        assert_eq!(g.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let bad = GenerateError::Status {
            status: 401,
            body: "no".into(),
        };
        let g = Resilient::new(Flaky::new(vec![bad]), policy(5));
        assert!(g.generate("p").await.is_err());
        assert_eq!(g.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn times_out_hung_calls() {
        let g = Resilient::new(
            Hangs,
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
                timeout: Some(Duration::from_millis(20)),
            },
        );
        assert!(matches!(g.generate("p").await, Err(GenerateError::Timeout(_))));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            timeout: None,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1000));
        assert_eq!(p.backoff(3), Duration::from_millis(2000));
        assert_eq!(p.backoff(50), MAX_BACKOFF);
    }

    #[test]
    fn config_conversion() {
        let p = RetryPolicy::from(&RetryConfig {
            max_attempts: 0,
            base_delay_ms: 10,
            timeout_secs: 0,
        });
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.timeout, None);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }
}
