use sparc_db::DbError;
use sparc_preprocess::{CatalogError, ParameterError};
use sparc_security::GuardError;
use thiserror::Error;

/// Rejected request. Raised synchronously; nothing is persisted or queued.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Path(GuardError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("Channel indices must be non-negative")]
    NegativeChannel,

    #[error("Output name cannot be empty")]
    EmptyOutputName,

    #[error("Run name cannot be empty")]
    EmptyRunName,

    #[error("{0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    NotFound(String),

    #[error("State store error: {0}")]
    Store(DbError),

    #[error("Method catalogue error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        ServiceError::NotFound(what.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ServiceError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}

impl From<GuardError> for ServiceError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::InvalidSlug { .. } | GuardError::PathEscape { .. } => {
                ServiceError::Validation(ValidationError::Path(err))
            }
            GuardError::NotInitialized { .. } => ServiceError::NotFound(err.to_string()),
            GuardError::Io(io) => ServiceError::Io(io),
        }
    }
}

impl From<ParameterError> for ServiceError {
    fn from(err: ParameterError) -> Self {
        ServiceError::Validation(err.into())
    }
}

impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        if err.is_not_found() {
            ServiceError::NotFound(err.to_string())
        } else {
            ServiceError::Store(err)
        }
    }
}
