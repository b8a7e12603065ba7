//! Data types for the publish flow.

use std::path::PathBuf;

use deltapush_protocol::RemoteFileRecord;

/// One publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: PathBuf,
    /// Record to publish into; `None` creates a new record.
    pub existing_id: Option<String>,
    pub friendly_name: String,
    /// Overrides the type inferred from the extension.
    pub mime_type: Option<String>,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>, friendly_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            existing_id: None,
            friendly_name: friendly_name.into(),
            mime_type: None,
        }
    }

    pub fn with_existing_id(mut self, id: impl Into<String>) -> Self {
        self.existing_id = Some(id.into());
        self
    }
}

/// Progress event emitted during a publish call.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishEvent {
    /// Progress update; `fraction` never decreases within one call.
    Progress {
        header: String,
        fraction: f64,
        status: String,
        sub_status: String,
    },
    /// The record holds the local content.
    Completed { record_id: String, version: u32 },
    /// The call failed.
    Failed { summary: String, details: String },
    /// The call was cancelled by the user.
    Cancelled,
}

/// How a successful call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A version was uploaded (or a resumed one finished).
    Uploaded { version: u32 },
    /// The latest version already holds identical content.
    AlreadyUpToDate { version: u32 },
}

impl PublishOutcome {
    pub fn version(&self) -> u32 {
        match self {
            Self::Uploaded { version } | Self::AlreadyUpToDate { version } => *version,
        }
    }
}

/// Result of a successful publish call.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub record: RemoteFileRecord,
    pub outcome: PublishOutcome,
    pub message: String,
}

/// Decided once per session: start a new version or finish an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Fresh,
    Resume { prior_version: u32 },
}

/// What is sent as the version's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentChoice {
    /// The whole local file.
    Full,
    /// A delta against the previous version's signature.
    Delta {
        path: PathBuf,
        digest: String,
        size: u64,
    },
}
