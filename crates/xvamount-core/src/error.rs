//! Error types for the xvamount core library.

use std::path::PathBuf;

/// The main error type for xvamount operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Malformed archive record or unmappable chunk.
    #[error("format error: {message}")]
    Format { message: String },

    /// A full scan found no disk references in the archive.
    #[error("no disk references found in archive")]
    Empty,

    /// Persisted index artifact is corrupt or no longer matches its source.
    #[error("index cache error: {message}")]
    Cache { message: String },

    /// A loop-device or device-mapper collaborator failed.
    #[error("mount error: {message}")]
    Mount { message: String },
}

/// A specialized Result type for xvamount operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create an index cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a mount error.
    pub fn mount(message: impl Into<String>) -> Self {
        Self::Mount {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
