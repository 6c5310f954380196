//! WriterError: unified error type for the time-step writer.
//!
//! Every public operation returns [`Result`]; nothing panics on bad input or
//! failed I/O, and nothing is retried.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Coarse classification of a [`WriterError`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// Bad partition data handed to `init`.
    InvalidMesh,
    /// API used out of order or with out-of-range arguments.
    InvalidSequence,
    /// Existing on-disk data disagrees with the current run.
    StorageConsistency,
    /// An underlying create/open/read/write/flush failed.
    BackendIo,
    /// Invalid construction parameters (variable table, options).
    InvalidConfiguration,
}

impl ErrorKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            ErrorKind::InvalidMesh => 1,
            ErrorKind::InvalidSequence => 2,
            ErrorKind::StorageConsistency => 3,
            ErrorKind::BackendIo => 4,
            ErrorKind::InvalidConfiguration => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ErrorKind::InvalidMesh),
            2 => Some(ErrorKind::InvalidSequence),
            3 => Some(ErrorKind::StorageConsistency),
            4 => Some(ErrorKind::BackendIo),
            5 => Some(ErrorKind::InvalidConfiguration),
            _ => None,
        }
    }
}

/// Unified error type for writer operations.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Zero counts, buffer length mismatches or out-of-range vertex indices.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
    /// `write_data` before `add_time_step`, bad variable index, use after close.
    #[error("invalid call sequence: {0}")]
    InvalidSequence(String),
    /// Append requested but the stored layout or step count does not match.
    #[error("storage consistency error: {0}")]
    StorageConsistency(String),
    /// A backend primitive failed.
    #[error("{op} failed for `{}`: {source}", path.display())]
    BackendIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Empty, duplicated or unusable variable names.
    #[error("invalid variable table: {0}")]
    InvalidVariables(String),
    /// Unusable base path or malformed writer options.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Another rank failed during a collective step.
    #[error("rank {rank} failed ({kind:?}): {message}")]
    PeerFailure {
        rank: usize,
        kind: ErrorKind,
        message: String,
    },
}

impl WriterError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriterError::InvalidMesh(_) => ErrorKind::InvalidMesh,
            WriterError::InvalidSequence(_) => ErrorKind::InvalidSequence,
            WriterError::StorageConsistency(_) => ErrorKind::StorageConsistency,
            WriterError::BackendIo { .. } => ErrorKind::BackendIo,
            WriterError::InvalidVariables(_) | WriterError::InvalidConfiguration(_) => {
                ErrorKind::InvalidConfiguration
            }
            WriterError::PeerFailure { kind, .. } => *kind,
        }
    }

    /// Wrap an I/O error with the failing operation and path.
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        WriterError::BackendIo {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, WriterError>;

/// Attach an operation name and path to a raw `io::Result`.
pub(crate) trait IoContext<T> {
    fn with_path(self, op: &'static str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_path(self, op: &'static str, path: &Path) -> Result<T> {
        self.map_err(|source| WriterError::io(op, path, source))
    }
}
