pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::ComponentKind;
pub use messages::{
    CreateRecordRequest, CreateVersionRequest, DescriptorDigest, FinishUploadRequest,
    UploadUrlResponse,
};
pub use types::{
    DescriptorStatus, FileCategory, FileDescriptor, RemoteFileRecord, UploadStatus, Version,
};
