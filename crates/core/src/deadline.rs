//! Hard time limit for a single async operation.
//!
//! The guard races the operation against a timer. When the timer wins the
//! operation future is dropped where it stands: nothing is sent to whatever
//! the operation was talking to, so a remote side (e.g. a page load in the
//! browser) may keep running until the caller deals with it.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// The operation did not complete within its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} timed out after {}ms", .after.as_millis())]
pub struct DeadlineExceeded {
    pub reason: String,
    pub after: Duration,
}

impl From<DeadlineExceeded> for crate::Error {
    fn from(e: DeadlineExceeded) -> Self {
        crate::Error::Timeout(e.to_string())
    }
}

/// Run `operation` with a hard limit of `limit`.
///
/// Returns the operation's own output if it finishes first, otherwise
/// [`DeadlineExceeded`] carrying `reason`.
pub async fn with_deadline<F, T>(
    operation: F,
    limit: Duration,
    reason: &str,
) -> std::result::Result<T, DeadlineExceeded>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| DeadlineExceeded {
            reason: reason.to_string(),
            after: limit,
        })
}
