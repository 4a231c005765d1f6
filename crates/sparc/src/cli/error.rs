//! Command failures with an exit code and optional hints.

use sparc::ServiceError;
use std::fmt;

/// Exit code for invalid input (bad config file, bad arguments).
pub const EXIT_INVALID: u8 = 1;
/// Exit code for a request the service refused or could not persist.
pub const EXIT_SUBMISSION: u8 = 2;

#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub suggestions: Vec<String>,
    pub exit_code: u8,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: u8) -> Self {
        Self {
            message: message.into(),
            suggestions: Vec::new(),
            exit_code,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR: {}", self.message)?;
        for suggestion in &self.suggestions {
            write!(f, "\n  {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for CliError {}

impl From<ServiceError> for CliError {
    fn from(err: ServiceError) -> Self {
        let hint = match &err {
            ServiceError::NotFound(_) => Some("TRY: sparc project list"),
            ServiceError::Validation(_) => Some("TRY: sparc methods   # list parameters per method"),
            _ => None,
        };
        let error = CliError::new(err.to_string(), EXIT_SUBMISSION);
        match hint {
            Some(hint) => error.with_suggestion(hint),
            None => error,
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(format!("{err:#}"), EXIT_INVALID)
    }
}

pub type CliResult<T = ()> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_exit_with_submission_code() {
        let error = CliError::from(ServiceError::NotFound("Project 'x' not found".into()));
        assert_eq!(error.exit_code, EXIT_SUBMISSION);
        assert_eq!(error.message, "Project 'x' not found");
        assert!(error.to_string().contains("sparc project list"));
    }
}
