//! Cooperative cancellation.
//!
//! Every suspension point in the coordination core accepts a
//! [`CancellationToken`] (re-exported from `tokio-util`, the ecosystem's
//! standard structured-cancellation primitive) rather than a hand-rolled
//! flag or channel.

use crate::error::CoordError;
use std::future::Future;
pub use tokio_util::sync::CancellationToken;

/// Runs `future` to completion unless `token` fires first, in which case
/// this returns [`CoordError::Cancelled`].
pub async fn or_cancelled<F, T>(token: &CancellationToken, future: F) -> Result<T, CoordError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoordError::Cancelled),
        value = future => Ok(value),
    }
}
