use deltapush_protocol::FinishUploadRequest;
use deltapush_remote::{ByteProgress, RemoteFiles};
use deltapush_transfer::digest_base64;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ComponentUpload, UploadReport};
use crate::cancel::{cancellable, check_cancelled};
use crate::error::PublishError;

/// Sends the whole component in one PUT with its digest attached.
///
/// Nothing survives a failed attempt; a retry starts again from byte 0
/// against the same descriptor.
pub(super) async fn upload(
    remote: &dyn RemoteFiles,
    component: &ComponentUpload<'_>,
    progress: ByteProgress,
    cancel: &CancellationToken,
) -> Result<UploadReport, PublishError> {
    check_cancelled(cancel)?;

    let data = tokio::fs::read(component.path).await?;
    if data.len() as u64 != component.size {
        return Err(PublishError::InvalidFile(format!(
            "{} changed size since it was hashed",
            component.path.display()
        )));
    }
    let checksum = digest_base64(component.digest).ok_or_else(|| {
        PublishError::InvalidState(format!("malformed digest {}", component.digest))
    })?;

    let url = cancellable(
        cancel,
        remote.request_upload_url(component.record_id, component.version, component.kind, None),
    )
    .await?;
    debug!(
        record = %component.record_id,
        version = component.version,
        kind = %component.kind,
        bytes = component.size,
        "simple upload started"
    );

    cancellable(cancel, remote.put_bytes(&url, data, Some(&checksum), progress)).await?;

    let record = cancellable(
        cancel,
        remote.finish_upload(
            component.record_id,
            component.version,
            component.kind,
            &FinishUploadRequest::default(),
        ),
    )
    .await?;

    Ok(UploadReport {
        record,
        bytes_sent: component.size,
        parts_skipped: 0,
        parts: Vec::new(),
    })
}
