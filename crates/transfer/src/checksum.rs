use std::io::Read;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(
    path: &Path,
    cancel: &CancellationToken,
) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes a file on the blocking pool.
///
/// The job always runs to completion or to its next cancellation check
/// before this returns.
pub async fn file_digest(path: &Path, cancel: &CancellationToken) -> Result<String, TransferError> {
    let path = path.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || calculate_file_checksum(&path, &cancel)).await?
}

/// Converts a hex digest to the base64 form used in request headers.
pub fn digest_base64(hex_digest: &str) -> Option<String> {
    let raw = hex::decode(hex_digest).ok()?;
    Some(BASE64.encode(raw))
}
