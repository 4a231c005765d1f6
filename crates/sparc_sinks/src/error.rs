use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors returned by store writers and readers.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{message}")]
    Message { message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid metadata in {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Annotation store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Failed to encode annotation: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

impl SinkError {
    pub(crate) fn message(message: impl Into<String>) -> Self {
        SinkError::Message {
            message: message.into(),
        }
    }

    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
        move |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
