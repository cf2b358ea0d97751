//! Filesystem safety for incoming DCC offers.
//!
//! The offered filename is used verbatim as the local file name, so anything
//! that could escape the download directory is refused before a socket is
//! opened or a file is touched.

use crate::dcc::error::{DccError, Result};
use std::path::{Path, PathBuf};

/// Reject names that are not a single plain path component.
pub fn validate_filename(filename: &str) -> Result<&str> {
    let illegal = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\'])
        || filename.chars().any(|c| c.is_control());
    if illegal {
        return Err(DccError::IllegalFilename(filename.to_string()));
    }
    Ok(filename)
}

/// Local path an offer is written to.
pub fn download_path(download_dir: &Path, filename: &str) -> Result<PathBuf> {
    Ok(download_dir.join(validate_filename(filename)?))
}

/// Create the download directory if needed and make sure it is a directory.
pub fn ensure_download_dir(download_dir: &Path) -> Result<()> {
    let target_dir_error = |source| DccError::TargetDir {
        path: download_dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(download_dir).map_err(target_dir_error)?;
    let meta = std::fs::metadata(download_dir).map_err(target_dir_error)?;
    if !meta.is_dir() {
        return Err(target_dir_error(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a directory",
        )));
    }
    Ok(())
}
