//! Incremental publish flow for a versioned remote file.
//!
//! This crate implements the **business logic** of pushing a local artifact
//! to the versioned-file service. It has no transport of its own: callers
//! hand it a [`RemoteFiles`](deltapush_remote::RemoteFiles) and a
//! [`Session`](deltapush_remote::Session).
//!
//! # Pipeline
//!
//! 1. **Session**: make sure the caller is logged in
//! 2. **Validate**: the local file is readable and has an extension
//! 3. **Record**: fetch or create the remote record, drop errored versions
//! 4. **Detect**: hash the file; identical content short-circuits
//! 5. **Prepare**: signature plus delta against the previous version
//! 6. **Upload**: content then signature, simple or multipart, resumable
//! 7. **Wait**: poll until the server finished processing

pub mod cache;
pub mod callbacks;
mod cancel;
pub mod config;
pub mod error;
pub mod mime;
pub mod orchestrator;
pub mod poller;
mod progress;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export primary types for convenience.
pub use cache::RecordCache;
pub use callbacks::{UploadCallbacks, upload};
pub use config::{PollConfig, PublishConfig};
pub use error::PublishError;
pub use mime::detect_mime_type;
pub use orchestrator::Publisher;
pub use poller::{Backoff, CompletionPoller};
pub use session::{ComponentFile, PartState, UploadSession};
pub use tracker::RecordTracker;
pub use transport::{ComponentUpload, TransportStrategy, UploadReport};
pub use types::{ContentChoice, PublishEvent, PublishOutcome, PublishResult, SessionKind, UploadRequest};
