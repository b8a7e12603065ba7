use serde::{Deserialize, Serialize};

use crate::constants::ComponentKind;

/// Upload mechanism the service assigned to a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    #[default]
    Simple,
    Multipart,
}

/// Status of a descriptor (or of a whole version).
///
/// Legal transitions are `Waiting -> Complete` and `Waiting -> Error`.
/// `None` marks a component the version does not carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorStatus {
    #[default]
    None,
    Waiting,
    Complete,
    Error,
}

/// Per-component upload record carrying the expected digest and size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    #[serde(default)]
    pub category: FileCategory,
    #[serde(default)]
    pub status: DescriptorStatus,
    /// Lowercase hex SHA-256 of the component bytes.
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size_in_bytes: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    /// Download location once the component is complete.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

impl FileDescriptor {
    /// Returns `true` if both digest and size equal the local candidate.
    pub fn matches(&self, digest: &str, size: u64) -> bool {
        self.size_in_bytes == size && self.digest.eq_ignore_ascii_case(digest)
    }

    pub fn is_waiting(&self) -> bool {
        self.status == DescriptorStatus::Waiting
    }

    pub fn is_complete(&self) -> bool {
        self.status == DescriptorStatus::Complete
    }
}

/// One integer-numbered revision of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub version: u32,
    #[serde(default)]
    pub status: DescriptorStatus,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, rename = "file", skip_serializing_if = "Option::is_none")]
    pub primary: Option<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<FileDescriptor>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
}

impl Version {
    /// Returns the descriptor for `kind`, if the version carries one.
    pub fn descriptor(&self, kind: ComponentKind) -> Option<&FileDescriptor> {
        match kind {
            ComponentKind::Primary => self.primary.as_ref(),
            ComponentKind::Delta => self.delta.as_ref(),
            ComponentKind::Signature => self.signature.as_ref(),
        }
    }

    /// Status of `kind`, `None` when the descriptor is absent.
    pub fn descriptor_status(&self, kind: ComponentKind) -> DescriptorStatus {
        self.descriptor(kind)
            .map(|d| d.status)
            .unwrap_or(DescriptorStatus::None)
    }

    fn descriptors(&self) -> impl Iterator<Item = &FileDescriptor> {
        [&self.primary, &self.delta, &self.signature]
            .into_iter()
            .flatten()
    }

    pub fn is_waiting(&self) -> bool {
        self.status == DescriptorStatus::Waiting
    }

    pub fn is_complete(&self) -> bool {
        self.status == DescriptorStatus::Complete
    }

    /// Version or any of its descriptors reached `Error`.
    pub fn has_error(&self) -> bool {
        self.status == DescriptorStatus::Error
            || self
                .descriptors()
                .any(|d| d.status == DescriptorStatus::Error)
    }

    /// A version may change only until one of its descriptors completes.
    pub fn is_mutable(&self) -> bool {
        !self.is_complete() && !self.descriptors().any(FileDescriptor::is_complete)
    }
}

/// Server-side handle for a versioned binary asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub versions: Vec<Version>,
    /// Error flag reported by the service for the record as a whole.
    #[serde(default)]
    pub error: bool,
}

impl RemoteFileRecord {
    /// Live (non-deleted) versions in ascending order.
    pub fn live_versions(&self) -> impl DoubleEndedIterator<Item = &Version> {
        self.versions.iter().filter(|v| !v.deleted)
    }

    pub fn latest_version(&self) -> Option<&Version> {
        self.live_versions().max_by_key(|v| v.version)
    }

    /// Latest version number, 0 when the record has no versions yet.
    pub fn latest_version_number(&self) -> u32 {
        self.latest_version().map(|v| v.version).unwrap_or(0)
    }

    pub fn version(&self, number: u32) -> Option<&Version> {
        self.live_versions().find(|v| v.version == number)
    }

    pub fn live_version_count(&self) -> usize {
        self.live_versions().count()
    }

    /// Newest complete version.
    pub fn latest_complete_version(&self) -> Option<&Version> {
        self.live_versions()
            .filter(|v| v.is_complete())
            .max_by_key(|v| v.version)
    }

    /// Returns `true` if the service flagged the record or the latest
    /// version is in an error state.
    pub fn is_in_error_state(&self) -> bool {
        self.error || self.latest_version().is_some_and(Version::has_error)
    }

    /// Returns `true` if the latest version still waits for content.
    pub fn is_waiting_for_upload(&self) -> bool {
        self.latest_version().is_some_and(Version::is_waiting)
    }
}

/// Server-reported progress of a multipart upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub file_name: String,
    /// Number of the last part the server accepted (1-based, 0 for none).
    pub next_part_number: u32,
    #[serde(default)]
    pub max_parts: u32,
    /// Etags of the accepted parts, in part order.
    #[serde(default)]
    pub etags: Vec<String>,
}

impl UploadStatus {
    /// Etag of an already accepted part, if the server holds one.
    ///
    /// Parts up to and including `next_part_number` count as accepted when
    /// the server also reports a non-empty etag for them.
    pub fn accepted_etag(&self, part_number: u32) -> Option<&str> {
        if part_number == 0 || part_number > self.next_part_number {
            return None;
        }
        self.etags
            .get(part_number as usize - 1)
            .map(String::as_str)
            .filter(|e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(status: DescriptorStatus) -> FileDescriptor {
        FileDescriptor {
            category: FileCategory::Simple,
            status,
            digest: "ab".into(),
            size_in_bytes: 2,
            ..Default::default()
        }
    }

    fn version(number: u32, status: DescriptorStatus) -> Version {
        Version {
            version: number,
            status,
            primary: Some(descriptor(status)),
            signature: Some(descriptor(status)),
            ..Default::default()
        }
    }

    #[test]
    fn latest_version_skips_deleted() {
        let mut record = RemoteFileRecord {
            id: "file_1".into(),
            name: "Asset".into(),
            versions: vec![
                version(1, DescriptorStatus::Complete),
                version(2, DescriptorStatus::Waiting),
            ],
            ..Default::default()
        };
        assert_eq!(record.latest_version_number(), 2);
        assert!(record.is_waiting_for_upload());

        record.versions[1].deleted = true;
        assert_eq!(record.latest_version_number(), 1);
        assert!(!record.is_waiting_for_upload());
        assert_eq!(record.live_version_count(), 1);
    }

    #[test]
    fn empty_record_has_no_latest() {
        let record = RemoteFileRecord::default();
        assert!(record.latest_version().is_none());
        assert_eq!(record.latest_version_number(), 0);
        assert!(!record.is_in_error_state());
    }

    #[test]
    fn service_error_flag_marks_record() {
        let json = r#"{"id":"file_1","name":"Asset","error":true,"versions":[]}"#;
        let record: RemoteFileRecord = serde_json::from_str(json).unwrap();
        assert!(record.error);
        assert!(record.is_in_error_state());

        let record: RemoteFileRecord =
            serde_json::from_str(r#"{"id":"file_1","name":"Asset"}"#).unwrap();
        assert!(!record.is_in_error_state());
    }

    #[test]
    fn error_in_any_descriptor_flags_version() {
        let mut v = version(3, DescriptorStatus::Waiting);
        assert!(!v.has_error());
        v.signature = Some(descriptor(DescriptorStatus::Error));
        assert!(v.has_error());
    }

    #[test]
    fn version_immutable_once_a_descriptor_completes() {
        let mut v = version(1, DescriptorStatus::Waiting);
        assert!(v.is_mutable());
        v.signature = Some(descriptor(DescriptorStatus::Complete));
        assert!(!v.is_mutable());
    }

    #[test]
    fn descriptor_match_requires_digest_and_size() {
        let d = descriptor(DescriptorStatus::Waiting);
        assert!(d.matches("AB", 2));
        assert!(!d.matches("ab", 3));
        assert!(!d.matches("cd", 2));
    }

    #[test]
    fn accepted_etag_includes_next_part_number() {
        let status = UploadStatus {
            next_part_number: 2,
            max_parts: 4,
            etags: vec!["e1".into(), "e2".into()],
            ..Default::default()
        };
        assert_eq!(status.accepted_etag(1), Some("e1"));
        assert_eq!(status.accepted_etag(2), Some("e2"));
        assert_eq!(status.accepted_etag(3), None);
        assert_eq!(status.accepted_etag(0), None);
    }

    #[test]
    fn accepted_etag_requires_an_etag() {
        let status = UploadStatus {
            next_part_number: 3,
            max_parts: 4,
            etags: vec!["e1".into(), String::new()],
            ..Default::default()
        };
        assert_eq!(status.accepted_etag(1), Some("e1"));
        assert_eq!(status.accepted_etag(2), None);
        assert_eq!(status.accepted_etag(3), None);
    }

    #[test]
    fn version_json_uses_file_key_for_primary() {
        let v = version(1, DescriptorStatus::Complete);
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"file\""));
        assert!(json.contains("\"complete\""));
        assert!(!json.contains("\"delta\""));
        let parsed: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, v);
    }
}
