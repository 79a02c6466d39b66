//! Retry policy for remote calls

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::ClientConfig;
use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            retries: 1,
            backoff: config.retry_backoff,
        }
    }

    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Run `op`, retrying timeouts and unreachable errors.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    with_retry_when(policy, what, RemoteError::is_retryable, op).await
}

/// Retry only failures where the request never reached the remote.
///
/// For calls that must not run twice.
pub async fn with_retry_unsent<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    with_retry_when(
        policy,
        what,
        |e| matches!(e, RemoteError::Unreachable(_)),
        op,
    )
    .await
}

async fn with_retry_when<T, F, Fut, P>(
    policy: RetryPolicy,
    what: &str,
    retryable: P,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
    P: Fn(&RemoteError) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.retries && retryable(&e) => {
                attempt += 1;
                warn!(
                    "{} failed ({}), retrying in {:?} [{}/{}]",
                    what, e, policy.backoff, attempt, policy.retries
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
