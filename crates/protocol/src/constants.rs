use serde::{Deserialize, Serialize};

/// Nominal multipart chunk size (50 MiB).
///
/// The server expects fixed-size parts; the final part absorbs the remainder.
pub const DEFAULT_MULTIPART_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Header carrying the base64 SHA-256 of a simple upload body.
pub const CONTENT_DIGEST_HEADER: &str = "x-amz-checksum-sha256";

/// Response header carrying a part's etag.
pub const ETAG_HEADER: &str = "etag";

/// Which component of a version a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Full content.
    #[serde(rename = "file")]
    Primary,
    /// Binary diff against the prior version.
    #[serde(rename = "delta")]
    Delta,
    /// Rolling-checksum blob of this version's primary content.
    #[serde(rename = "signature")]
    Signature,
}

impl ComponentKind {
    /// Path segment used by the service for this component.
    pub fn as_path(self) -> &'static str {
        match self {
            Self::Primary => "file",
            Self::Delta => "delta",
            Self::Signature => "signature",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_path())
    }
}
