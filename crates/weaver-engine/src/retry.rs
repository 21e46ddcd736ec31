use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use weaver_core::config::RetryConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{SamplingProvider, SamplingRequest, SamplingResponse};

/// A sampler that retries transient provider failures.
///
/// The policy comes from each request's `config.retry`; requests without
/// one are attempted exactly once.
pub struct RetryingSampler {
    inner: Arc<dyn SamplingProvider>,
}

impl RetryingSampler {
    pub fn new(inner: Arc<dyn SamplingProvider>) -> Self {
        Self { inner }
    }
}

fn is_retryable(e: &WeaverError) -> bool {
    match e {
        WeaverError::Provider(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
                || msg.contains("rate limit")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl SamplingProvider for RetryingSampler {
    fn sample(&self, request: SamplingRequest) -> BoxFuture<'_, Result<SamplingResponse>> {
        Box::pin(async move {
            let Some(policy) = request.config.retry.clone() else {
                return self.inner.sample(request).await;
            };

            let mut attempt = 0;
            loop {
                match self.inner.sample(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) if is_retryable(&e) && attempt < policy.max_retries => {
                        let backoff = calculate_backoff(attempt, &policy);
                        warn!(
                            attempt = attempt + 1,
                            max_retries = policy.max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying sampling request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
