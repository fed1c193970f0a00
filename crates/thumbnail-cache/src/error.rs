//! Error taxonomy shared by every tier of the thumbnail pipeline

use crate::key::ThumbnailKey;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = ThumbnailError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    /// Pre-hashed lookup missed the memory tier
    #[error("no cached image")]
    NotCached,

    #[error("thumbnail {0} is not in the disk cache")]
    NotFound(ThumbnailKey),

    #[error("thumbnail request cancelled")]
    Cancelled,

    #[error("thumbnail service shutting down")]
    ShuttingDown,

    #[error("thumbnail generation failed: {0:#}")]
    Generation(anyhow::Error),

    #[error("thumbnail generation failed: timeout after {0:?}")]
    Timeout(Duration),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("pixel data is {actual} bytes, expected {expected}")]
    InvalidBuffer { expected: usize, actual: usize },

    #[error("invalid cache configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Unavailable(&'static str),
}

impl ThumbnailError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the terminal states a caller asked for or caused by teardown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ShuttingDown)
    }

    /// Rebuild an equivalent error for another caller of a merged request
    ///
    /// Wrapped sources are flattened to their rendered message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::NotCached => Self::NotCached,
            Self::NotFound(key) => Self::NotFound(*key),
            Self::Cancelled => Self::Cancelled,
            Self::ShuttingDown => Self::ShuttingDown,
            Self::Generation(e) => Self::Generation(anyhow::anyhow!("{:#}", e)),
            Self::Timeout(limit) => Self::Timeout(*limit),
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::Codec(message) => Self::Codec(message.clone()),
            Self::InvalidBuffer { expected, actual } => Self::InvalidBuffer {
                expected: *expected,
                actual: *actual,
            },
            Self::Config(message) => Self::Config(message.clone()),
            Self::Unavailable(reason) => Self::Unavailable(*reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_is_cancelled() {
        assert!(ThumbnailError::Cancelled.is_cancelled());
        assert!(ThumbnailError::ShuttingDown.is_cancelled());
        assert!(!ThumbnailError::Timeout(Duration::from_secs(1)).is_cancelled());
        assert!(!ThumbnailError::Generation(anyhow::anyhow!("bad media")).is_cancelled());
    }

    #[test]
    fn test_duplicate_keeps_kind_and_message() {
        let original = ThumbnailError::Generation(anyhow::anyhow!("decoder").context("bad media"));
        let copy = original.duplicate();
        assert!(matches!(copy, ThumbnailError::Generation(_)));
        assert_eq!(copy.to_string(), original.to_string());

        let original = ThumbnailError::io("/tmp/x.jpg", io::Error::new(io::ErrorKind::NotFound, "gone"));
        match original.duplicate() {
            ThumbnailError::Io { path, source } => {
                assert_eq!(path, PathBuf::from("/tmp/x.jpg"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            ThumbnailError::Timeout(Duration::from_millis(5)).duplicate(),
            ThumbnailError::Timeout(limit) if limit == Duration::from_millis(5)
        ));
    }
}
