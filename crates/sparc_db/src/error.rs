//! Errors raised by the state store.

use sparc_protocol::JobStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("State store query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The directory holding the store file could not be created.
    #[error("Cannot prepare state store directory: {0}")]
    Io(#[from] std::io::Error),

    /// Missing project, ingest record, preprocess job or store file.
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    /// The ingest record exists but belongs to another project.
    #[error("Ingest record {record_id} not found in project {project_id}")]
    ForeignIngestRecord { record_id: i64, project_id: i64 },

    /// A manifest path is recorded at most once.
    #[error("Snapshot manifest already recorded: {manifest}")]
    DuplicateSnapshot { manifest: String },

    /// Status change outside the job lifecycle, or one lost to a concurrent writer.
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Task {task_id} is not claimed")]
    TaskNotClaimed { task_id: String },

    /// Stored status, task kind or task state this build does not know.
    #[error("Unrecognized {column} '{value}' in state store")]
    UnknownValue { column: &'static str, value: String },

    #[error("Cannot encode or decode JSON column: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn unknown_value(column: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownValue {
            column,
            value: value.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ForeignIngestRecord { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_record() {
        let err = DbError::InvalidTransition {
            entity: "Preprocess job",
            id: 7,
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(err.to_string(), "Preprocess job 7 cannot move from completed to running");

        let err = DbError::not_found("Project", "'alpha'");
        assert_eq!(err.to_string(), "Project 'alpha' not found");
        assert!(err.is_not_found());

        let err = DbError::ForeignIngestRecord {
            record_id: 3,
            project_id: 9,
        };
        assert_eq!(err.to_string(), "Ingest record 3 not found in project 9");
        assert!(err.is_not_found());

        assert!(!DbError::unknown_value("task state", "paused").is_not_found());
    }
}
