//! Remote error types.

/// Errors returned by a [`RemoteFiles`](crate::RemoteFiles) implementation.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload response carried no etag")]
    MissingEtag,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RemoteError {
    /// HTTP status of an API rejection, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Returns `true` for 400-class rejections.
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}
