use std::sync::Arc;

use deltapush_protocol::FinishUploadRequest;
use deltapush_remote::{ByteProgress, RemoteError, RemoteFiles};
use deltapush_transfer::{PartPlan, read_part};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{ComponentUpload, UploadReport};
use crate::cancel::{cancellable, check_cancelled};
use crate::error::PublishError;
use crate::session::PartState;

/// Sends the component in fixed-size parts, skipping parts the server
/// accepted during an earlier attempt.
pub(super) async fn upload(
    remote: &dyn RemoteFiles,
    component: &ComponentUpload<'_>,
    chunk_size: u64,
    progress: ByteProgress,
    cancel: &CancellationToken,
) -> Result<UploadReport, PublishError> {
    let plan = PartPlan::new(component.size, chunk_size);
    let status = cancellable(
        cancel,
        remote.get_upload_status(component.record_id, component.version, component.kind),
    )
    .await?;

    let server_parts = status.as_ref().map_or(0, |s| s.max_parts);
    if server_parts != 0 && server_parts != plan.count() {
        return Err(PublishError::RecordMismatch {
            version: component.version,
            kind: component.kind,
            detail: format!(
                "server expects {server_parts} parts, local plan has {}",
                plan.count()
            ),
        });
    }

    let total = component.size;
    let mut parts = Vec::with_capacity(plan.count() as usize);
    let mut done = 0u64;
    let mut bytes_sent = 0u64;
    let mut parts_skipped = 0u32;

    for range in plan.parts() {
        if let Some(etag) = status.as_ref().and_then(|s| s.accepted_etag(range.number)) {
            trace!(part = range.number, "part already accepted");
            parts.push(PartState {
                number: range.number,
                len: range.len,
                etag: etag.to_string(),
                resumed: true,
            });
            done += range.len;
            parts_skipped += 1;
            progress(done, total);
            continue;
        }

        check_cancelled(cancel)?;
        let url = cancellable(
            cancel,
            remote.request_upload_url(
                component.record_id,
                component.version,
                component.kind,
                Some(range.number),
            ),
        )
        .await?;
        let data = read_part(component.path, range).await?;

        let base = done;
        let outer = progress.clone();
        let part_progress: ByteProgress = Arc::new(move |sent, _| outer(base + sent, total));
        let etag = cancellable(cancel, remote.put_bytes(&url, data, None, part_progress))
            .await?
            .filter(|e| !e.is_empty())
            .ok_or(PublishError::Transport(RemoteError::MissingEtag))?;

        debug!(
            record = %component.record_id,
            kind = %component.kind,
            part = range.number,
            parts = plan.count(),
            bytes = range.len,
            "part uploaded"
        );
        parts.push(PartState {
            number: range.number,
            len: range.len,
            etag,
            resumed: false,
        });
        done += range.len;
        bytes_sent += range.len;
    }

    let finish = FinishUploadRequest {
        etags: parts.iter().map(|p| p.etag.clone()).collect(),
        next_part_number: plan.count(),
        max_parts: plan.count(),
    };
    let record = cancellable(
        cancel,
        remote.finish_upload(component.record_id, component.version, component.kind, &finish),
    )
    .await?;

    Ok(UploadReport {
        record,
        bytes_sent,
        parts_skipped,
        parts,
    })
}
