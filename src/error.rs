use thiserror::Error;

/// Main error type for Reldisco
#[derive(Error, Debug)]
pub enum ReldiscoError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of persisted candidate fields
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Graph store failures (unreachable store, rejected write)
    #[error("Graph store error: {0}")]
    GraphStore(String),

    /// Confidence oracle failures (network, malformed response)
    #[error("Oracle error: {0}")]
    Oracle(String),

    /// Relation candidate not found
    #[error("Relation candidate not found: {0}")]
    CandidateNotFound(String),

    /// Entity without a usable identity key
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    /// A full processing run is already active
    #[error("A processing run is already in progress")]
    RunInProgress,

    /// The run was cancelled before it completed
    #[error("Run cancelled")]
    Cancelled,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ReldiscoError {
    /// Whether this error should abort a whole run instead of being
    /// isolated to the entity or candidate that raised it.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            ReldiscoError::Database(_)
                | ReldiscoError::Io(_)
                | ReldiscoError::Config(_)
                | ReldiscoError::Cancelled
        )
    }
}

/// Convenient Result type using ReldiscoError
pub type Result<T> = std::result::Result<T, ReldiscoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReldiscoError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: ReldiscoError = rusqlite_err.into();
        assert!(matches!(err, ReldiscoError::Database(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<Vec<String>>("{not json").unwrap_err();
        let err: ReldiscoError = json_err.into();
        assert!(matches!(err, ReldiscoError::Serialization(_)));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ReldiscoError::Config("x".into()).is_fatal_for_run());
        assert!(ReldiscoError::Cancelled.is_fatal_for_run());
        assert!(!ReldiscoError::Oracle("timeout".into()).is_fatal_for_run());
        assert!(!ReldiscoError::InvalidEntity("no key".into()).is_fatal_for_run());
        assert!(!ReldiscoError::CandidateNotFound("r1".into()).is_fatal_for_run());
    }
}
