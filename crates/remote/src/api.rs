//! Call surface of the versioned-file service.
//!
//! The publish flow talks to the service only through these traits, so tests
//! can substitute an in-memory implementation.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use deltapush_protocol::{
    ComponentKind, CreateRecordRequest, CreateVersionRequest, FinishUploadRequest,
    RemoteFileRecord, UploadStatus,
};

use crate::error::RemoteError;

/// Boxed future returned by every remote call.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Byte progress callback `(bytes_transferred, total_bytes)`.
pub type ByteProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Record, version and upload calls.
///
/// Dropping a returned future aborts the request; callers cancel by racing
/// it against a cancellation token.
pub trait RemoteFiles: Send + Sync {
    /// Creates a new empty record.
    fn create_record<'a>(&'a self, req: &'a CreateRecordRequest)
    -> RemoteFuture<'a, RemoteFileRecord>;

    /// Fetches an existing record by id.
    fn fetch_record<'a>(&'a self, record_id: &'a str) -> RemoteFuture<'a, RemoteFileRecord>;

    /// Re-reads a record after server-side changes.
    fn refresh_record<'a>(&'a self, record_id: &'a str) -> RemoteFuture<'a, RemoteFileRecord> {
        self.fetch_record(record_id)
    }

    /// Appends a version announcing the digests and sizes about to be sent.
    fn create_version<'a>(
        &'a self,
        record_id: &'a str,
        req: &'a CreateVersionRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord>;

    /// Deletes one version of a record.
    fn delete_version<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
    ) -> RemoteFuture<'a, RemoteFileRecord>;

    /// Requests a one-time signed upload URL, per part for multipart components.
    fn request_upload_url<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
        part_number: Option<u32>,
    ) -> RemoteFuture<'a, String>;

    /// PUTs `data` to a signed URL and returns the etag the store replied with.
    ///
    /// `digest` is the base64 SHA-256 the store verifies the body against.
    fn put_bytes<'a>(
        &'a self,
        url: &'a str,
        data: Vec<u8>,
        digest: Option<&'a str>,
        progress: ByteProgress,
    ) -> RemoteFuture<'a, Option<String>>;

    /// Signals that every byte of a component was sent.
    fn finish_upload<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
        req: &'a FinishUploadRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord>;

    /// Server-side multipart progress; `None` when no upload was started.
    fn get_upload_status<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
    ) -> RemoteFuture<'a, Option<UploadStatus>>;

    /// Streams a completed component to `dest`, returning the bytes written.
    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> RemoteFuture<'a, u64>;
}

/// Process-wide login state.
pub trait Session: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Performs a login with the configured credentials.
    fn login(&self) -> RemoteFuture<'_, ()>;
}
