//! Backoff policy for idempotent JSON-RPC reads.
//!
//! Statuses 408, 429 and 5xx are retried, as are connect and timeout failures.
//! A `Retry-After` of under a minute replaces the computed backoff. Delays grow
//! as `initial_delay * 2^step`, are capped at `max_delay`, then down-jittered.
//!
//! Broadcasting a signed transaction goes through [`RetryConfig::no_retry`]: a
//! resent raw transaction is not guaranteed to be harmless.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};

const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that may be shaved off at random.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `step + 1`. A valid `Retry-After` wins.
    #[must_use]
    pub fn delay(&self, step: u32, headers: Option<&HeaderMap>) -> Duration {
        if let Some(hinted) = headers.and_then(retry_after) {
            return hinted;
        }
        let exponent = step.min(30) as i32;
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let shaved = rand::random::<f64>() * self.jitter_factor.clamp(0.0, 1.0);
        Duration::from_secs_f64(capped * (1.0 - shaved))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get("retry-after")?.to_str().ok()?.trim().parse().ok()?;
    let hinted = Duration::from_secs(secs);
    (!hinted.is_zero() && hinted < MAX_RETRY_AFTER).then_some(hinted)
}

#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

/// What came back from the endpoint after the last attempt.
#[derive(Debug)]
pub enum Delivery {
    /// 2xx.
    Delivered(Response),
    /// Non-2xx, either not retryable or still failing once retries ran out.
    Rejected(Response),
    /// No HTTP response at all.
    Unreachable {
        attempts: u32,
        source: reqwest::Error,
    },
}

/// Send the request built by `build`, retrying per `config`. `build` runs once per attempt.
pub async fn send<F>(build: F, config: &RetryConfig) -> Delivery
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let retries_left = attempt < config.max_retries;
        let (delay, reason) = match build().send().await {
            Ok(response) if response.status().is_success() => {
                return Delivery::Delivered(response);
            }
            Ok(response) => {
                let status = response.status();
                if !retries_left || !is_retryable_status(status) {
                    return Delivery::Rejected(response);
                }
                (
                    config.delay(attempt, Some(response.headers())),
                    status.to_string(),
                )
            }
            Err(source) => {
                if !retries_left || !is_retryable_error(&source) {
                    return Delivery::Unreachable {
                        attempts: attempt + 1,
                        source,
                    };
                }
                (config.delay(attempt, None), source.to_string())
            }
        };
        attempt += 1;
        tracing::debug!(attempt, delay_ms = delay.as_millis(), %reason, "Retrying RPC request");
        tokio::time::sleep(delay).await;
    }
}
