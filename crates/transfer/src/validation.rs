use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// A local artifact that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub size: u64,
    /// Extension including the leading dot, e.g. `".bundle"`.
    pub extension: String,
}

/// Checks that `path` is a readable regular file with an extension.
pub fn validate_local_file(path: &Path) -> Result<LocalFile, TransferError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| {
            TransferError::InvalidFile(format!("{} has no extension", path.display()))
        })?;

    let metadata = std::fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(TransferError::InvalidFile(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    // Opening proves readability; metadata alone does not.
    std::fs::File::open(path)?;

    Ok(LocalFile {
        path: path.to_path_buf(),
        size: metadata.len(),
        extension: format!(".{extension}"),
    })
}

/// Validates that `name` is a single, plain path component.
///
/// Used for names that become directory names under a temp root (record
/// ids), so they cannot escape it.
pub(crate) fn validate_component_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidFile("empty name".into()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidFile(format!(
            "not a plain path component: {name}"
        ))),
    }
}
