//! Deadlines
//!
//! Every suspension point on the write and read paths takes an absolute
//! deadline. Expiry surfaces as `ShardError::Timeout` naming what was awaited.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, ShardError};

/// Absolute point in time after which a waiting operation gives up
pub type Deadline = tokio::time::Instant;

/// Deadline `timeout` from now
pub fn deadline_after(timeout: Duration) -> Deadline {
    Deadline::now() + timeout
}

/// A deadline that never fires in practice. Used by streaming work that must
/// not be killed by admission control.
pub fn no_deadline() -> Deadline {
    Deadline::now() + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}

/// Run `fut` until it completes or `deadline` passes
pub async fn with_deadline<F, T>(deadline: Deadline, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ShardError::Timeout(what)),
    }
}
