use crate::core::error::PipelineError;
use crate::core::progress::{ProgressEvent, ProgressObserver};
use log::{debug, warn};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Headroom added on top of a provider-suggested delay.
const SUGGESTED_DELAY_HEADROOM: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Wait before the next attempt after `failures` rate-limited calls.
    fn backoff(&self, failures: u32, message: &str) -> Duration {
        suggested_delay(message)
            .map(|d| d + SUGGESTED_DELAY_HEADROOM)
            .unwrap_or_else(|| self.base_delay * failures)
    }
}

/// Runs fallible provider calls, sleeping through rate limits.
#[derive(Clone)]
pub struct RetryController {
    observer: Arc<dyn ProgressObserver>,
}

impl RetryController {
    pub fn new(observer: Arc<dyn ProgressObserver>) -> Self {
        Self { observer }
    }

    /// Invokes `op` until it succeeds, fails with a non rate-limit error, or
    /// `policy.max_attempts` invocations have been spent.
    pub async fn run<T, F, Fut>(
        &self,
        mut op: F,
        policy: RetryPolicy,
        context: &str,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut failures = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_rate_limited() {
                return Err(err);
            }

            failures += 1;
            let message = err.to_string();
            if failures >= policy.max_attempts {
                warn!("{} gave up after {} attempts: {}", context, failures, message);
                return Err(PipelineError::RetriesExhausted {
                    context: context.to_string(),
                    attempts: failures,
                    message,
                });
            }

            let delay = policy.backoff(failures, &message);
            debug!("{} rate limited (attempt {}), sleeping {:?}", context, failures, delay);
            self.observer.notify(ProgressEvent::Waiting {
                context: context.to_string(),
                delay,
            });
            tokio::time::sleep(delay).await;
        }
    }
}

/// Extracts a `retryDelay` hint from the JSON document embedded in a provider
/// error message, e.g. `... {"error": {"details": [{"retryDelay": "17s"}]}}`.
pub fn suggested_delay(message: &str) -> Option<Duration> {
    let start = message.find('{')?;
    let body: Value = serde_json::from_str(&message[start..]).ok()?;
    find_retry_delay(&body).and_then(parse_duration)
}

fn find_retry_delay(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get("retryDelay") {
                return Some(s.as_str());
            }
            map.values().find_map(find_retry_delay)
        }
        Value::Array(items) => items.iter().find_map(find_retry_delay),
        _ => None,
    }
}

fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (number, scale) = if let Some(ms) = text.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(s) = text.strip_suffix('s') {
        (s, 1.0)
    } else {
        (text, 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(value * scale))
}
