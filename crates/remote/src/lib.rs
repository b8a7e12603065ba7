//! Remote side of the upload pipeline.
//!
//! [`RemoteFiles`] is the call surface the publish flow drives; [`Session`]
//! answers whether the caller is logged in. [`HttpRemoteFiles`] implements
//! both over the service's REST API.

pub mod api;
pub mod config;
pub mod error;
pub mod http;

pub use api::{ByteProgress, RemoteFiles, RemoteFuture, Session};
pub use config::RemoteConfig;
pub use error::RemoteError;
pub use http::HttpRemoteFiles;
