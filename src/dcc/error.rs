//! Error kinds raised by the DCC transfer engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DccError>;

#[derive(Debug, Error)]
pub enum DccError {
    /// The CTCP payload matched none of the known DCC request shapes.
    #[error("unrecognized DCC request: {0:?}")]
    Protocol(String),

    /// TCP connect, bind or listen failed for a single session.
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// A DCC ACCEPT arrived that matches no session waiting for one.
    #[error("no transfer is waiting for a resume acknowledgement on {0}")]
    ResumeMismatch(String),

    #[error("offered filename {0:?} contains a path separator")]
    IllegalFilename(String),

    #[error("download directory {} is unusable: {source}", path.display())]
    TargetDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("passive token {0} is already used by another transfer")]
    DuplicateToken(u64),

    #[error(
        "{} already holds {local} bytes but only {offered} were offered",
        path.display()
    )]
    LocalFileConflict {
        path: PathBuf,
        local: u64,
        offered: u64,
    },

    #[error("transfer cancelled")]
    Cancelled,
}

impl DccError {
    /// Fatal errors abort the whole run; everything else stays scoped to one
    /// session or one incoming message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DccError::IllegalFilename(_) | DccError::TargetDir { .. })
    }
}

impl From<rustls::Error> for DccError {
    fn from(e: rustls::Error) -> Self {
        DccError::Tls(e.to_string())
    }
}
