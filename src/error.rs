//! Error types for nnmusic.
//!
//! File-level variants ([`Error::NotFound`], [`Error::InvalidFormat`],
//! [`Error::RateMismatch`], [`Error::ChannelMismatch`]) are expected when
//! scanning real-world audio folders. Directory scanners catch them, log a
//! warning and move on; everything else aborts the running command.

use std::path::{Path, PathBuf};

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File or directory does not exist.
    #[error("{} does not exist", path.display())]
    NotFound { path: PathBuf },

    /// The decoder could not parse the file.
    #[error("{} is not a valid audio file: {reason}", path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    /// Decoded sample rate differs from the expected one.
    #[error("{} has sample rate {found} Hz, expected {expected} Hz", path.display())]
    RateMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// Decoded channel count differs from the expected one.
    #[error("{} has {found} channels, expected {expected}", path.display())]
    ChannelMismatch {
        path: PathBuf,
        found: usize,
        expected: usize,
    },

    /// Shapes, hyperparameters or destinations that make the operation impossible.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Missing or unreadable checkpoint.
    #[error("checkpoint {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },

    /// Corpus container that cannot be parsed or has inconsistent shapes.
    #[error("corpus {}: {reason}", path.display())]
    Corpus { path: PathBuf, reason: String },

    /// A background thread died before finishing its work.
    #[error("{0}")]
    Worker(String),

    /// I/O failure on a named path.
    #[error("io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// True for failures that only disqualify a single audio file.
    pub fn is_file_level(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::InvalidFormat { .. }
                | Error::RateMismatch { .. }
                | Error::ChannelMismatch { .. }
        )
    }

    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound { path }
        } else {
            Error::Io { path, source }
        }
    }

    pub(crate) fn checkpoint(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Error::Checkpoint {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corpus(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Error::Corpus {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }
}
