//! MD5 verification of finished downloads.
//!
//! Bots usually announce the checksum in a NOTICE. Verification runs on the
//! blocking pool with its own copy of the path and digest, so it never holds
//! up the transfer loop and never touches session state.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DIGEST_LEN: usize = 32;

/// Markers tried in order, with the distance from the marker to the digest.
const MARKERS: [(&str, usize); 3] = [("md5sum", 8), ("MD5", 4), ("md5", 4)];

/// Pull a 32-digit hex MD5 out of free-form bot text such as
/// `** md5sum: 9e107d9d372bb6826bd81d3542a419d6`.
pub fn extract_md5(text: &str) -> Option<String> {
    let (start, offset) = MARKERS
        .iter()
        .find_map(|(marker, offset)| text.find(marker).map(|pos| (pos, *offset)))?;
    let begin = start + offset;
    let digest = text.get(begin..begin + DIGEST_LEN)?;
    if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(digest.to_ascii_lowercase())
}

pub fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Immutable snapshot handed to the worker.
#[derive(Debug, Clone)]
pub struct ChecksumJob {
    pub path: PathBuf,
    pub expected: String,
}

impl ChecksumJob {
    pub fn new(path: PathBuf, expected: String) -> Self {
        Self { path, expected }
    }

    /// Hash and compare; the outcome is only logged.
    pub fn run(self) -> bool {
        info!("Verifying md5 of {}", self.path.display());
        match file_md5(&self.path) {
            Ok(actual) if actual.eq_ignore_ascii_case(&self.expected) => {
                info!("md5 ok for {}: {}", self.path.display(), actual);
                true
            }
            Ok(actual) => {
                warn!(
                    "md5 mismatch for {}: expected {}, got {}",
                    self.path.display(),
                    self.expected,
                    actual
                );
                false
            }
            Err(e) => {
                warn!("could not hash {}: {}", self.path.display(), e);
                false
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<bool> {
        tokio::task::spawn_blocking(move || self.run())
    }
}
