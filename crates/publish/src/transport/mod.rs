//! Transport strategies for one version component.
//!
//! The service assigns each descriptor a category; [`TransportStrategy`]
//! picks the matching mechanism. Both report byte progress and stop at the
//! next await point once the cancellation token fires.

mod multipart;
mod simple;

use std::path::Path;

use deltapush_protocol::{ComponentKind, FileCategory, RemoteFileRecord};
use deltapush_remote::{ByteProgress, RemoteFiles};
use tokio_util::sync::CancellationToken;

use crate::error::PublishError;
use crate::session::PartState;

/// Everything a transport needs to send one component.
pub struct ComponentUpload<'a> {
    pub record_id: &'a str,
    pub version: u32,
    pub kind: ComponentKind,
    pub path: &'a Path,
    pub size: u64,
    /// Lowercase hex SHA-256 of the component.
    pub digest: &'a str,
}

/// Outcome of a component upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    /// Record as returned by the finish call.
    pub record: RemoteFileRecord,
    /// Bytes PUT during this attempt.
    pub bytes_sent: u64,
    /// Parts skipped because the server already held them.
    pub parts_skipped: u32,
    /// Multipart parts in order; empty for simple uploads.
    pub parts: Vec<PartState>,
}

/// Upload mechanism for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStrategy {
    /// One PUT of the whole payload.
    Simple,
    /// Fixed-size parts, each acknowledged with an etag.
    Multipart { chunk_size: u64 },
}

impl TransportStrategy {
    pub fn for_category(category: FileCategory, chunk_size: u64) -> Self {
        match category {
            FileCategory::Simple => Self::Simple,
            FileCategory::Multipart => Self::Multipart { chunk_size },
        }
    }

    pub async fn upload(
        &self,
        remote: &dyn RemoteFiles,
        component: &ComponentUpload<'_>,
        progress: ByteProgress,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, PublishError> {
        match *self {
            Self::Simple => simple::upload(remote, component, progress, cancel).await,
            Self::Multipart { chunk_size } => {
                multipart::upload(remote, component, chunk_size, progress, cancel).await
            }
        }
    }
}
