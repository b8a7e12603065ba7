//! Client-local state of one upload attempt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use deltapush_protocol::ComponentKind;
use deltapush_transfer::{LocalFile, TempWorkspace};
use tracing::warn;

use crate::types::{ContentChoice, SessionKind};

/// Upload state of one multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartState {
    pub number: u32,
    pub len: u64,
    pub etag: String,
    /// Accepted by the server during an earlier attempt.
    pub resumed: bool,
}

/// A local file sent as one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFile {
    pub path: PathBuf,
    pub size: u64,
    pub digest: String,
}

/// One upload attempt. Never persisted; dropped after the call returns.
#[derive(Debug)]
pub struct UploadSession {
    record_id: String,
    local: LocalFile,
    digest: String,
    kind: SessionKind,
    content: ContentChoice,
    signature: Option<ComponentFile>,
    version: Option<u32>,
    parts: HashMap<ComponentKind, Vec<PartState>>,
    bytes_sent: u64,
    workspace: TempWorkspace,
}

impl UploadSession {
    pub fn new(record_id: String, local: LocalFile, workspace: TempWorkspace) -> Self {
        Self {
            record_id,
            local,
            digest: String::new(),
            kind: SessionKind::Fresh,
            content: ContentChoice::Full,
            signature: None,
            version: None,
            parts: HashMap::new(),
            bytes_sent: 0,
            workspace,
        }
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn path(&self) -> &Path {
        &self.local.path
    }

    pub fn size(&self) -> u64 {
        self.local.size
    }

    pub fn extension(&self) -> &str {
        &self.local.extension
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn set_digest(&mut self, digest: String) {
        self.digest = digest;
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Decides fresh-vs-resume. Called once, after change detection.
    pub fn set_kind(&mut self, kind: SessionKind) {
        self.kind = kind;
    }

    pub fn is_resume(&self) -> bool {
        matches!(self.kind, SessionKind::Resume { .. })
    }

    pub fn content(&self) -> &ContentChoice {
        &self.content
    }

    pub fn set_content(&mut self, content: ContentChoice) {
        self.content = content;
    }

    /// Component carrying the new content.
    pub fn content_kind(&self) -> ComponentKind {
        match self.content {
            ContentChoice::Full => ComponentKind::Primary,
            ContentChoice::Delta { .. } => ComponentKind::Delta,
        }
    }

    /// Local file sent for the content component.
    pub fn content_payload(&self) -> ComponentFile {
        match &self.content {
            ContentChoice::Full => ComponentFile {
                path: self.local.path.clone(),
                size: self.local.size,
                digest: self.digest.clone(),
            },
            ContentChoice::Delta { path, digest, size } => ComponentFile {
                path: path.clone(),
                size: *size,
                digest: digest.clone(),
            },
        }
    }

    /// Signature generated for this attempt, if one was needed.
    pub fn signature(&self) -> Option<&ComponentFile> {
        self.signature.as_ref()
    }

    pub fn set_signature(&mut self, signature: ComponentFile) {
        self.signature = Some(signature);
    }

    pub fn add_bytes_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
    }

    /// Bytes PUT during this attempt, across all components.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = Some(version);
    }

    pub fn record_parts(&mut self, kind: ComponentKind, parts: Vec<PartState>) {
        self.parts.insert(kind, parts);
    }

    pub fn parts(&self, kind: ComponentKind) -> &[PartState] {
        self.parts.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn workspace(&self) -> &TempWorkspace {
        &self.workspace
    }

    /// Removes the session's temp files. Failures are logged, not returned.
    pub async fn cleanup(&mut self) -> bool {
        let removed = self.workspace.cleanup().await;
        if !removed {
            warn!(
                record = %self.record_id,
                dir = %self.workspace.dir().display(),
                "temp workspace left behind"
            );
        }
        removed
    }
}
