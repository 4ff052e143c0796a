//! Error types for careloop

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Patient not found: {0}")]
    PatientNotFound(String),

    #[error("Protocol not found: {0}")]
    ProtocolNotFound(i64),

    #[error("Invalid check-in step: {0}")]
    InvalidStep(String),

    #[error("Check-in step regression: {from} -> {to}")]
    StepRegression { from: String, to: String },

    #[error("Unscoreable answer: grade '{grade}' perspective '{perspective}'")]
    Scoring { grade: String, perspective: String },

    #[error("Invalid status transition for scheduled message {0}")]
    InvalidTransition(i64),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PatientNotFound("+5511999990000".to_string());
        assert!(err.to_string().contains("+5511999990000"));
    }

    #[test]
    fn test_scoring_error_display() {
        let err = Error::Scoring {
            grade: "Z".to_string(),
            perspective: "alimentacao".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Z"));
        assert!(msg.contains("alimentacao"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
