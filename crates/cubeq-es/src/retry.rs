//! Retry with exponential backoff for transient backend failures

use cubeq_engine::{checkpoint, sleep};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{BackendError, SearchBackend};
use crate::EsError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Ceiling for any single delay
    pub max_delay: Duration,

    /// Backoff growth per attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the failed attempt numbered `attempt` (zero based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32, error: &BackendError) -> bool {
        error.is_transient() && attempt + 1 < self.max_attempts
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts or
/// the token fires
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, EsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        checkpoint(token)?;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(attempt, &e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Backend call failed, retrying"
                );
                sleep(token, delay).await?;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Search with retries; a response reporting failed shards counts as a
/// transient failure
pub async fn search_with_retry(
    backend: &dyn SearchBackend,
    index: &str,
    body: &Value,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Value, EsError> {
    with_retry(policy, token, "search", || async move {
        let response = backend.search(index, body).await?;
        check_shards(&response)?;
        Ok::<_, BackendError>(response)
    })
    .await
}

fn check_shards(response: &Value) -> Result<(), BackendError> {
    let shards = &response["_shards"];
    let failed = shards["failed"].as_u64().unwrap_or(0);
    if failed > 0 {
        return Err(BackendError::ShardFailures {
            failed,
            total: shards["total"].as_u64().unwrap_or(failed),
        });
    }
    Ok(())
}
