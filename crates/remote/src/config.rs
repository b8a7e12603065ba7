//! Connection settings for the versioned-file service.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://files.example.com/api/v1";

/// Remote service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Bearer token; `None` leaves the session unauthenticated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub user_agent: String,
    /// Timeout for API calls. Content PUTs and downloads are not bounded by it.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            auth_token: None,
            user_agent: concat!("deltapush/", env!("CARGO_PKG_VERSION")).into(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
