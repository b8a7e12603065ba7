//! Per-record temp folder for signature and delta files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::TransferError;
use crate::validation::validate_component_name;

const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Temp subfolder `<root>/<record_id>/` owned by one upload session.
///
/// [`cleanup`](Self::cleanup) removes it with retries; dropping an
/// uncleaned workspace makes one last synchronous attempt.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: PathBuf,
    cleaned: bool,
}

impl TempWorkspace {
    /// Creates (or reuses) the folder for `record_id` under `root`.
    pub fn create(root: &Path, record_id: &str) -> Result<Self, TransferError> {
        validate_component_name(record_id)?;
        let dir = root.join(record_id);
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "temp workspace created");
        Ok(Self {
            dir,
            cleaned: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Signature of the new content.
    pub fn signature_path(&self) -> PathBuf {
        self.dir.join("content.sig")
    }

    /// Delta of the new content against the previous version.
    pub fn delta_path(&self) -> PathBuf {
        self.dir.join("content.delta")
    }

    /// Downloaded signature of the previous version.
    pub fn reference_signature_path(&self) -> PathBuf {
        self.dir.join("previous.sig")
    }

    /// Removes the folder, retrying transient failures. A folder that is
    /// already gone counts as removed.
    pub async fn cleanup(&mut self) -> bool {
        if self.cleaned {
            return true;
        }
        for attempt in 1..=CLEANUP_ATTEMPTS {
            match tokio::fs::remove_dir_all(&self.dir).await {
                Ok(()) => {
                    self.cleaned = true;
                    debug!(dir = %self.dir.display(), "temp workspace removed");
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.cleaned = true;
                    return true;
                }
                Err(e) => {
                    warn!(
                        dir = %self.dir.display(),
                        attempt,
                        error = %e,
                        "failed to remove temp workspace"
                    );
                    if attempt < CLEANUP_ATTEMPTS {
                        tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
                    }
                }
            }
        }
        false
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}
