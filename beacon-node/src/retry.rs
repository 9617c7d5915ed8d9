//! Bounded retries of chain calls.

use std::future::Future;

use tracing::warn;

use crate::{config::BackoffPolicy, ChainError, NodeError};

impl From<ChainError> for NodeError {
    fn from(error: ChainError) -> Self {
        match error {
            ChainError::Unavailable(reason) => NodeError::ChainUnavailable {
                operation: "chain call",
                attempts: 1,
                reason,
            },
            ChainError::AlreadySubmitted => NodeError::SubmissionConflict,
            ChainError::Rejected(reason) => NodeError::ChainRejected(reason),
        }
    }
}

/// Run `call` until it succeeds, fails with anything but
/// [`ChainError::Unavailable`], or runs out of attempts.
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, NodeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(ChainError::Unavailable(reason)) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(NodeError::ChainUnavailable {
                        operation,
                        attempts: attempt,
                        reason,
                    });
                }
                let delay = policy.delay(attempt - 1);
                warn!(operation, attempt, ?delay, %reason, "chain call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error.into()),
        }
    }
}
