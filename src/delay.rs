//! Cancellation-aware waiting

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// Sleep for `duration` unless `cancel` fires first
///
/// The token is checked before the wait starts, so an already-cancelled
/// token never sleeps. A zero duration still observes cancellation.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    if cancel.is_cancelled() {
        return Err(ClientError::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
