//! Error types for the Smelter library.
//!
//! Validation findings are deliberately *not* errors: they accumulate into a
//! [`ValidationResult`](crate::validate::ValidationResult) so one bad table
//! never blocks inspection of the rest of a run.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Smelter operations.
#[derive(Debug, Error)]
pub enum SmelterError {
    /// Invalid or ambiguous profile, unknown strategy, or exceeded limit.
    /// Fatal: raised before extraction begins.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A mandatory path or key could not be resolved. Scoped to one table.
    #[error("Extraction error for table '{table}': {message}")]
    Extraction { table: String, message: String },

    /// A regex rule with an `error` failure policy did not match, or a
    /// required content path had no value and no default.
    #[error("Context resolution failed for field '{field}': {message}")]
    Context { field: String, message: String },

    /// An invalid calculated-column expression. Scoped to one column.
    #[error("Transform error for column '{column}': {message}")]
    Transform { column: String, message: String },

    /// A stage lifecycle gating violation. Rejected with zero state mutation.
    #[error("Stage graph error: {0}")]
    StageGraph(String),

    /// The run's cancellation token was triggered.
    #[error("Cancelled")]
    Cancelled,

    /// Error reading or accessing a file.
    #[error("IO error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error decoding CSV input.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Regex compilation error.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl SmelterError {
    /// Construct a table-scoped extraction error.
    pub fn extraction(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Construct a column-scoped transform error.
    pub fn transform(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            column: column.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for Smelter operations.
pub type Result<T> = std::result::Result<T, SmelterError>;
