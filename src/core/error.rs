/// Tablekit Error Module
///
/// This module defines the error taxonomy shared by every layer of the
/// table-access engine. Executor operations convert most of these into `err`
/// envelopes; only identifier problems escape as `Err` so that malformed
/// names are rejected before the database is touched.
use std::collections::BTreeMap;
use thiserror::Error;

/// Field name to the list of messages produced for it by the validator.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Comprehensive error type for the table-access engine.
#[derive(Error, Debug)]
pub enum TablekitError {
    /// A table or column name failed the identifier check
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A comparison operator outside the allow-list was requested
    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    /// The payload contained no column usable for the statement
    #[error("No valid fields provided for {0}")]
    NoValidFields(String),

    /// The predicate contained no column usable for the statement
    #[error("No valid where condition provided for {0}")]
    NoValidWhere(String),

    /// Declared field rules rejected the payload
    #[error("Validation failed for {} field(s)", .0.len())]
    Validation(FieldErrors),

    /// The table has no columns in the database
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Every pool slot is checked out
    #[error("Connection pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// Driver errors from SQLite operations
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema cache file could not be written
    #[error("Cache write failure: {0}")]
    CacheWrite(String),

    /// Transaction-related errors
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TablekitError {
    /// Stable machine-readable code placed in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            TablekitError::InvalidIdentifier(_) => "invalid_identifier",
            TablekitError::InvalidOperator(_) => "invalid_operator",
            TablekitError::NoValidFields(_) => "no_valid_fields",
            TablekitError::NoValidWhere(_) => "no_valid_where",
            TablekitError::Validation(_) => "validation_error",
            TablekitError::UnknownTable(_) => "unknown_table",
            TablekitError::PoolExhausted { .. } => "pool_exhausted",
            TablekitError::Database(_) => "driver_error",
            TablekitError::CacheWrite(_) => "cache_write_failure",
            TablekitError::Transaction(_) => "transaction_error",
            TablekitError::Config(_) => "config_error",
            TablekitError::Io(_) => "io_error",
            TablekitError::Json(_) => "json_error",
        }
    }

    /// Whether the message may leak driver or schema internals.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            TablekitError::Database(_)
                | TablekitError::UnknownTable(_)
                | TablekitError::Io(_)
                | TablekitError::CacheWrite(_)
        )
    }

    /// Whether this error must propagate instead of becoming an envelope.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TablekitError::InvalidIdentifier(_) | TablekitError::InvalidOperator(_)
        )
    }
}

/// Type alias for Result to use TablekitError as the error type.
pub type Result<T> = std::result::Result<T, TablekitError>;
