//! Write-then-rename helpers so that a stage output is either complete or absent.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Sibling path used while `path` is being produced.
///
/// The partial name keeps the original file name as suffix so that tools
/// which pick an encoding from the extension (e.g. `.nii.gz`) behave the same
/// for the partial file.
pub fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".partial-{name}"))
}

/// Move a finished partial file over its final path.
pub fn commit(partial: &Path, path: &Path) -> io::Result<()> {
    fs::rename(partial, path)
}

/// Delete `path` if it exists.
pub fn discard(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
