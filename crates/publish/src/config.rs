//! Publish flow settings.
//!
//! Durations are stored as integer milliseconds or seconds so the structs
//! map directly onto TOML tables.

use std::path::PathBuf;
use std::time::Duration;

use deltapush_protocol::constants::DEFAULT_MULTIPART_CHUNK_SIZE;
use deltapush_transfer::DEFAULT_BLOCK_SIZE;
use serde::{Deserialize, Serialize};

/// Settings for one [`Publisher`](crate::Publisher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Nominal multipart part size in bytes.
    pub multipart_chunk_size: u64,
    /// Try a delta against the previous version before sending full content.
    pub delta_enabled: bool,
    /// Parent folder of the per-record temp workspaces.
    pub temp_root: PathBuf,
    /// Signature block size in bytes.
    pub block_size: usize,
    /// How often a cancellation predicate is evaluated.
    pub cancel_poll_interval_ms: u64,
    pub poll: PollConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            multipart_chunk_size: DEFAULT_MULTIPART_CHUNK_SIZE,
            delta_enabled: true,
            temp_root: std::env::temp_dir().join("deltapush"),
            block_size: DEFAULT_BLOCK_SIZE,
            cancel_poll_interval_ms: 50,
            poll: PollConfig::default(),
        }
    }
}

impl PublishConfig {
    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms.max(1))
    }
}

/// Backoff and timeout of the completion poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Payload bytes granted one `per_chunk_timeout_secs` of waiting.
    pub timeout_chunk_bytes: u64,
    pub per_chunk_timeout_secs: u64,
    pub max_timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            timeout_chunk_bytes: 100 * 1024 * 1024,
            per_chunk_timeout_secs: 120,
            max_timeout_secs: 1_800,
        }
    }
}

impl PollConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms).min(self.max_delay())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay of the round after one that waited `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        current.mul_f64(factor).min(self.max_delay())
    }

    /// Total wait budget for a payload of `size` bytes:
    /// `clamp(ceil(size / chunk) * per_chunk, per_chunk, max)`.
    pub fn total_timeout(&self, size: u64) -> Duration {
        let per_chunk = self.per_chunk_timeout_secs;
        let max = self.max_timeout_secs.max(per_chunk);
        let chunks = size.div_ceil(self.timeout_chunk_bytes.max(1));
        let secs = chunks.saturating_mul(per_chunk).clamp(per_chunk, max);
        Duration::from_secs(secs)
    }
}
