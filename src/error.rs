use thiserror::Error;

use crate::model::ModelError;

/// Main error type for the overtake pipeline
#[derive(Error, Debug)]
pub enum OvertakeError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // I/O and serialization
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Input contract violations
    #[error("Missing required field `{field}` at row {row}")]
    MissingField { row: usize, field: &'static str },

    #[error("Invalid value {value:?} for field `{field}` at row {row}")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },

    #[error("Invalid tyre compound: {0:?} (expected SOFT, MEDIUM or HARD)")]
    InvalidCompound(String),

    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    // Data volume
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    // Training
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Every model configuration failed; no artifact written")]
    AllModelsFailed,

    // Artifact persistence
    #[error("No training artifact found under {0}")]
    ArtifactNotFound(String),

    #[error("Artifact bundle is inconsistent: {0}")]
    ArtifactMismatch(String),
}

pub type Result<T> = std::result::Result<T, OvertakeError>;
