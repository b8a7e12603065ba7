//! Local side of an incremental upload: content digests, rolling-checksum
//! signatures, binary deltas, multipart planning and temp workspaces.
//!
//! Blocking work (hashing, signature and delta generation) has async
//! wrappers that run it on tokio's blocking pool. Each job checks its
//! cancellation token once per read and returns
//! [`TransferError::Cancelled`] after removing any partial output.

mod cancel;
mod checksum;
mod chunked;
mod delta;
mod progress;
mod rolling;
mod signature;
mod validation;
mod workspace;

pub use checksum::{
    calculate_file_checksum, checksum_bytes, digest_base64, file_digest,
};
pub use chunked::{PartPlan, PartRange, read_part};
pub use delta::{
    DeltaOp, DeltaStats, apply_delta, apply_delta_bytes, compute_delta, compute_delta_blocking,
    encode_delta_bytes, parse_delta,
};
pub use progress::ThroughputMeter;
pub use rolling::RollingChecksum;
pub use signature::{
    BlockSignature, Signature, generate_signature, generate_signature_blocking,
};
pub use validation::{LocalFile, validate_local_file};
pub use workspace::TempWorkspace;

/// Default signature block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("invalid file: {0}")]
    InvalidFile(String),

    #[error("cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
