//! Remote record and version state.
//!
//! Every record-returning call refreshes the [`RecordCache`].

use deltapush_protocol::{
    ComponentKind, CreateRecordRequest, CreateVersionRequest, DescriptorStatus, FileDescriptor,
    RemoteFileRecord, Version,
};
use deltapush_remote::RemoteFiles;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::RecordCache;
use crate::cancel::cancellable;
use crate::error::PublishError;

/// Drives a record through its version lifecycle.
pub struct RecordTracker<'a> {
    remote: &'a dyn RemoteFiles,
    cache: RecordCache,
    cancel: &'a CancellationToken,
}

impl<'a> RecordTracker<'a> {
    pub fn new(
        remote: &'a dyn RemoteFiles,
        cache: RecordCache,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            remote,
            cache,
            cancel,
        }
    }

    fn remember(&self, record: RemoteFileRecord) -> RemoteFileRecord {
        self.cache.insert(&record);
        record
    }

    /// Fetches `existing_id`, or creates a new record when there is none.
    pub async fn fetch_or_create(
        &self,
        existing_id: Option<&str>,
        create: &CreateRecordRequest,
    ) -> Result<RemoteFileRecord, PublishError> {
        let record = match existing_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                debug!(record = %id, "fetching record");
                cancellable(self.cancel, self.remote.fetch_record(id)).await?
            }
            None => {
                let record = cancellable(self.cancel, self.remote.create_record(create)).await?;
                info!(record = %record.id, name = %record.name, "record created");
                record
            }
        };
        Ok(self.remember(record))
    }

    pub async fn refresh(&self, record_id: &str) -> Result<RemoteFileRecord, PublishError> {
        let record = cancellable(self.cancel, self.remote.refresh_record(record_id)).await?;
        Ok(self.remember(record))
    }

    /// Creates a version and returns the record with its number.
    ///
    /// The service must answer with a strictly higher latest version.
    pub async fn create_version(
        &self,
        record: &RemoteFileRecord,
        req: &CreateVersionRequest,
    ) -> Result<(RemoteFileRecord, u32), PublishError> {
        let previous = record.latest_version_number();
        let updated = cancellable(self.cancel, self.remote.create_version(&record.id, req)).await?;
        let version = updated.latest_version_number();
        if version <= previous {
            return Err(PublishError::InvalidState(format!(
                "record {} did not advance past version {previous}",
                record.id
            )));
        }
        info!(record = %record.id, version, delta = req.delta.is_some(), "version created");
        Ok((self.remember(updated), version))
    }

    /// Deletes the latest version of `record`.
    ///
    /// Rejected when the record has no version, when the latest version is
    /// complete, and when it is the only version.
    pub async fn delete_latest_version(
        &self,
        record: &RemoteFileRecord,
    ) -> Result<RemoteFileRecord, PublishError> {
        let latest = check_deletable(record)?;
        let updated =
            cancellable(self.cancel, self.remote.delete_version(&record.id, latest)).await?;
        info!(record = %record.id, version = latest, "version deleted");
        Ok(self.remember(updated))
    }

    /// Current status of one component of `version`.
    pub async fn component_status(
        &self,
        record_id: &str,
        version: u32,
        kind: ComponentKind,
    ) -> Result<(RemoteFileRecord, DescriptorStatus), PublishError> {
        let record = self.refresh(record_id).await?;
        let status = record
            .version(version)
            .map(|v| v.descriptor_status(kind))
            .ok_or_else(|| missing_version(record_id, version))?;
        Ok((record, status))
    }

    /// Version-level status of `version`.
    pub async fn version_status(
        &self,
        record_id: &str,
        version: u32,
    ) -> Result<(RemoteFileRecord, DescriptorStatus), PublishError> {
        let record = self.refresh(record_id).await?;
        let status = record
            .version(version)
            .map(|v| v.status)
            .ok_or_else(|| missing_version(record_id, version))?;
        Ok((record, status))
    }
}

fn missing_version(record_id: &str, version: u32) -> PublishError {
    PublishError::InvalidState(format!("record {record_id} has no version {version}"))
}

fn check_deletable(record: &RemoteFileRecord) -> Result<u32, PublishError> {
    let latest = record
        .latest_version()
        .ok_or_else(|| PublishError::InvalidState(format!("record {} has no version", record.id)))?;
    if latest.is_complete() {
        return Err(PublishError::InvalidState(format!(
            "version {} of {} is complete and cannot be deleted",
            latest.version, record.id
        )));
    }
    if record.live_version_count() <= 1 {
        return Err(PublishError::InvalidState(format!(
            "refusing to delete the only version of {}",
            record.id
        )));
    }
    Ok(latest.version)
}

/// Returns `true` if [`RecordTracker::delete_latest_version`] would accept
/// `record`.
pub fn can_delete_latest(record: &RemoteFileRecord) -> bool {
    check_deletable(record).is_ok()
}

/// Checks that the descriptor of `kind` expects exactly the local candidate.
pub fn validate_descriptor<'v>(
    version: &'v Version,
    kind: ComponentKind,
    digest: &str,
    size: u64,
) -> Result<&'v FileDescriptor, PublishError> {
    let mismatch = |detail: String| PublishError::RecordMismatch {
        version: version.version,
        kind,
        detail,
    };
    let descriptor = version
        .descriptor(kind)
        .ok_or_else(|| mismatch("descriptor missing".into()))?;
    if descriptor.size_in_bytes != size {
        return Err(mismatch(format!(
            "remote expects {} bytes, local has {size}",
            descriptor.size_in_bytes
        )));
    }
    if !descriptor.digest.eq_ignore_ascii_case(digest) {
        return Err(mismatch(format!(
            "remote digest {} differs from local {digest}",
            descriptor.digest
        )));
    }
    Ok(descriptor)
}

/// Latest version that is still waiting for the same full content.
///
/// This is what makes a repeated call resume instead of starting over.
pub fn find_resumable(record: &RemoteFileRecord, digest: &str, size: u64) -> Option<u32> {
    let latest = record.latest_version()?;
    let primary = latest.descriptor(ComponentKind::Primary)?;
    (latest.is_waiting() && primary.matches(digest, size)).then_some(latest.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRemote, complete_version, waiting_version};

    fn record_with(versions: Vec<Version>) -> RemoteFileRecord {
        RemoteFileRecord {
            id: "rec".into(),
            name: "Build".into(),
            versions,
            ..RemoteFileRecord::default()
        }
    }

    #[test]
    fn sole_version_cannot_be_deleted() {
        let record = record_with(vec![waiting_version(1, "d1", 10)]);
        assert!(!can_delete_latest(&record));
        assert!(matches!(
            check_deletable(&record),
            Err(PublishError::InvalidState(_))
        ));
    }

    #[test]
    fn complete_version_cannot_be_deleted() {
        let record = record_with(vec![
            complete_version(1, "d1", 10),
            complete_version(2, "d2", 10),
        ]);
        assert!(!can_delete_latest(&record));
    }

    #[test]
    fn waiting_latest_version_can_be_deleted() {
        let record = record_with(vec![
            complete_version(1, "d1", 10),
            waiting_version(2, "d2", 10),
        ]);
        assert_eq!(check_deletable(&record).unwrap(), 2);
    }

    #[test]
    fn empty_record_has_nothing_to_delete() {
        assert!(!can_delete_latest(&record_with(Vec::new())));
    }

    #[test]
    fn validate_descriptor_rejects_size_and_digest_mismatch() {
        let version = waiting_version(3, "abcd", 100);

        assert!(validate_descriptor(&version, ComponentKind::Primary, "ABCD", 100).is_ok());

        let err = validate_descriptor(&version, ComponentKind::Primary, "abcd", 99).unwrap_err();
        assert!(matches!(
            err,
            PublishError::RecordMismatch { version: 3, kind: ComponentKind::Primary, .. }
        ));

        let err = validate_descriptor(&version, ComponentKind::Primary, "ffff", 100).unwrap_err();
        assert!(err.to_string().contains("differs"));

        let err = validate_descriptor(&version, ComponentKind::Delta, "abcd", 100).unwrap_err();
        assert!(err.to_string().contains("descriptor missing"));
    }

    #[test]
    fn resumable_only_when_waiting_and_matching() {
        let waiting = record_with(vec![
            complete_version(1, "d1", 10),
            waiting_version(2, "d2", 20),
        ]);
        assert_eq!(find_resumable(&waiting, "d2", 20), Some(2));
        assert_eq!(find_resumable(&waiting, "d2", 21), None);
        assert_eq!(find_resumable(&waiting, "d1", 10), None);

        let complete = record_with(vec![complete_version(1, "d1", 10)]);
        assert_eq!(find_resumable(&complete, "d1", 10), None);
    }

    #[tokio::test]
    async fn create_version_updates_cache() {
        let remote = MemoryRemote::new();
        let cache = RecordCache::new();
        let cancel = CancellationToken::new();
        let tracker = RecordTracker::new(&remote, cache.clone(), &cancel);

        let create = CreateRecordRequest {
            name: "Build".into(),
            mime_type: "application/zip".into(),
            extension: ".zip".into(),
        };
        let record = tracker.fetch_or_create(None, &create).await.unwrap();
        assert_eq!(record.latest_version_number(), 0);

        let req = CreateVersionRequest {
            file_digest: "d1".into(),
            file_size_in_bytes: 10,
            signature_digest: "s1".into(),
            signature_size_in_bytes: 4,
            delta: None,
        };
        let (updated, version) = tracker.create_version(&record, &req).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(cache.get(&record.id).unwrap(), updated);

        let (_, status) = tracker
            .component_status(&record.id, 1, ComponentKind::Signature)
            .await
            .unwrap();
        assert_eq!(status, DescriptorStatus::Waiting);

        let err = tracker.version_status(&record.id, 9).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidState(_)));
    }

    #[tokio::test]
    async fn cancelled_tracker_calls_return_cancelled() {
        let remote = MemoryRemote::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tracker = RecordTracker::new(&remote, RecordCache::new(), &cancel);

        let err = tracker.refresh("missing").await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
