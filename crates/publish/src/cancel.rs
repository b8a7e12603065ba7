use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::PublishError;

/// Runs `fut` unless `cancel` fires first; a cancelled future is dropped,
/// which aborts any request it had in flight.
pub(crate) async fn cancellable<T, E, F>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, PublishError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PublishError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PublishError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), PublishError> {
    if cancel.is_cancelled() {
        Err(PublishError::Cancelled)
    } else {
        Ok(())
    }
}
