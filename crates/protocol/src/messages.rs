use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Creates a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordRequest {
    pub name: String,
    pub mime_type: String,
    pub extension: String,
}

/// Digest and size announced for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorDigest {
    pub digest: String,
    pub size_in_bytes: u64,
}

/// Creates a new version on an existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVersionRequest {
    pub file_digest: String,
    pub file_size_in_bytes: u64,
    pub signature_digest: String,
    pub signature_size_in_bytes: u64,
    /// Present when the content is sent as a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DescriptorDigest>,
}

/// Signals that all bytes of a component were sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishUploadRequest {
    /// Part etags in part order; empty for simple uploads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etags: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub next_part_number: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_parts: u32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// One-time signed upload location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadUrlResponse {
    pub url: String,
}
