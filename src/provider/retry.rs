// src/provider/retry.rs — Transient-failure retry for model providers
//
// Retried: rate limits (429), server errors (5xx), timeouts, connection failures.
// Not retried: bad request, auth errors, malformed responses.
// A request that still fails afterwards reaches the controller as one
// backend failure and counts once against the error budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, ModelInfo, ModelProvider};
use crate::infra::config::ProviderConfig;
use crate::infra::errors::RlmError;

/// Added to a server-provided retry-after hint.
const HINT_MARGIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread applied around each delay, as a fraction of it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            ..Default::default()
        }
    }

    /// Wait before retry number `attempt` (0-indexed). A retry-after hint
    /// from the server replaces the exponential schedule.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint + HINT_MARGIN;
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay);
        let factor = spread(attempt, self.jitter);
        Duration::from_secs_f64((exp.as_secs_f64() * factor).max(0.001))
    }
}

/// Reproducible multiplier in [1 - jitter, 1 + jitter].
fn spread(attempt: u32, jitter: f64) -> f64 {
    let unit = attempt.wrapping_mul(2_654_435_761) as f64 / u32::MAX as f64;
    1.0 + jitter * (2.0 * unit - 1.0)
}

fn retry_after(error: &RlmError) -> Option<Duration> {
    match error {
        RlmError::RateLimited { retry_after_ms, .. } if *retry_after_ms > 0 => {
            Some(Duration::from_millis(*retry_after_ms))
        }
        _ => None,
    }
}

/// Wraps a provider and retries `chat()` on retriable errors.
pub struct RetryProvider {
    inner: Arc<dyn ModelProvider>,
    policy: RetryPolicy,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ModelProvider for RetryProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.inner.models()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, RlmError> {
        let mut attempt = 0;
        loop {
            let err = match self.inner.chat(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if !err.is_retriable() || attempt >= self.policy.max_retries {
                return Err(err);
            }
            let wait = self.policy.delay(attempt, retry_after(&err));
            tracing::warn!(
                provider = self.inner.id(),
                model = %request.model,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                "Transient provider error, retrying: {}",
                err
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TokenUsage;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then answers.
    struct Flaky {
        failures: u32,
        retriable: bool,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, retriable: bool) -> Arc<Self> {
            Arc::new(Self {
                failures,
                retriable,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelProvider for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }
        fn name(&self) -> &str {
            "Flaky"
        }
        fn models(&self) -> Vec<ModelInfo> {
            vec![]
        }
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, RlmError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(RlmError::Provider {
                    provider: "flaky".into(),
                    message: "HTTP 503".into(),
                    retriable: self.retriable,
                });
            }
            Ok(ChatResponse {
                content: "ok".into(),
                usage: TokenUsage::default(),
                cost: None,
                model: None,
            })
        }
    }

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let inner = Flaky::new(2, true);
        let provider = RetryProvider::new(inner.clone(), quick(3));
        let resp = provider.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let inner = Flaky::new(5, false);
        let provider = RetryProvider::new(inner.clone(), quick(3));
        assert!(provider.chat(ChatRequest::default()).await.is_err());
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_stops_after_configured_retries() {
        let inner = Flaky::new(100, true);
        let provider = RetryProvider::new(inner.clone(), quick(2));
        assert!(provider.chat(ChatRequest::default()).await.is_err());
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_from_config() {
        let cfg = ProviderConfig {
            max_retries: 0,
            ..Default::default()
        };
        let inner = Flaky::new(1, true);
        let provider = RetryProvider::new(inner.clone(), RetryPolicy::from_config(&cfg));
        assert!(provider.chat(ChatRequest::default()).await.is_err());
        assert_eq!(inner.calls(), 1);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        let first = policy.delay(0, None).as_millis();
        let second = policy.delay(1, None).as_millis();
        assert!((800..=1200).contains(&first), "{first}");
        assert!((1600..=2400).contains(&second), "{second}");
        assert!(policy.delay(40, None) <= Duration::from_secs(36));
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let policy = RetryPolicy::default();
        let err = RlmError::RateLimited {
            provider: "p".into(),
            retry_after_ms: 3_000,
        };
        let hint = retry_after(&err);
        assert_eq!(hint, Some(Duration::from_millis(3_000)));
        assert_eq!(policy.delay(5, hint), Duration::from_millis(3_100));

        let no_hint = RlmError::RateLimited {
            provider: "p".into(),
            retry_after_ms: 0,
        };
        assert!(retry_after(&no_hint).is_none());
    }

    #[test]
    fn test_spread_bounds() {
        for attempt in 0..32 {
            let f = spread(attempt, 0.2);
            assert!((0.8..=1.2).contains(&f), "{f}");
        }
    }
}
