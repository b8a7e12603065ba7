//! Publish error types.

use std::time::Duration;

use deltapush_protocol::ComponentKind;
use deltapush_remote::RemoteError;
use deltapush_transfer::TransferError;

/// Errors produced by a publish call.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("delta error: {0}")]
    Delta(String),

    #[error("record mismatch on {kind} of version {version}: {detail}")]
    RecordMismatch {
        version: u32,
        kind: ComponentKind,
        detail: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] RemoteError),

    #[error("timed out after {waited:?} waiting for {what}")]
    UploadTimeout { what: String, waited: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("remote session not initialized: {0}")]
    NotInitialized(String),

    #[error("invalid file: {0}")]
    InvalidFile(String),

    #[error("server failed to process {0}")]
    ServerProcessing(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl PublishError {
    /// Returns `true` for user-initiated aborts, which callers should not
    /// present as failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short headline for error dialogs.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::Io(_) => "Could not read or write a local file",
            Self::Delta(_) => "Could not compute the delta",
            Self::RecordMismatch { .. } => "Remote record is out of sync",
            Self::Transport(_) => "Network transfer failed",
            Self::UploadTimeout { .. } => "Server processing timed out",
            Self::Cancelled => "Upload cancelled",
            Self::NotInitialized(_) => "Not logged in",
            Self::InvalidFile(_) => "Invalid file",
            Self::ServerProcessing(_) => "Server rejected the upload",
            Self::InvalidState(_) => "Unexpected record state",
        }
    }
}

impl From<TransferError> for PublishError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Io(e) => Self::Io(e),
            TransferError::InvalidFile(msg) => Self::InvalidFile(msg),
            TransferError::InvalidSignature(msg) | TransferError::InvalidDelta(msg) => {
                Self::Delta(msg)
            }
            TransferError::Task(msg) => Self::Io(std::io::Error::other(msg)),
            TransferError::Cancelled => Self::Cancelled,
        }
    }
}
