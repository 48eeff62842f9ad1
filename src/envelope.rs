//! Uniform result object returned by every table operation.
use crate::core::{FieldErrors, Record, TablekitError, Value};
use serde::Serialize;
use std::time::Instant;

/// Generic text shown instead of driver details outside debug mode.
pub const GENERIC_FAILURE: &str = "The operation could not be completed";

/// Status tag of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resp {
    Ok,
    Select,
    NoData,
    Add,
    Edit,
    NoChange,
    Dele,
    NoRegistro,
    Err,
}

/// Error details carried by `err` envelopes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

/// SQL trace attached in debug mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugTrace {
    pub operation: String,
    pub sql: String,
    pub values: Vec<Value>,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub resp: Resp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<Vec<Record>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_data: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_data: Option<Record>,
    pub count: u64,
    #[serde(rename = "TIME_SECOND")]
    pub time_second: f64,
    /// Field-level validation messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<FieldErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugTrace>,
}

impl Envelope {
    /// Empty envelope timed from `started`.
    pub fn new(resp: Resp, started: Instant) -> Self {
        Envelope {
            resp,
            row: None,
            insert_data: None,
            delete_data: None,
            count: 0,
            time_second: started.elapsed().as_secs_f64(),
            errors: None,
            error: None,
            debug: None,
        }
    }

    /// `err` envelope for a recoverable failure. Driver and filesystem
    /// messages are replaced by [`GENERIC_FAILURE`] unless `debug` is set.
    pub fn from_error(err: &TablekitError, debug: bool, started: Instant) -> Self {
        let message = if err.is_sensitive() && !debug {
            GENERIC_FAILURE.to_string()
        } else {
            err.to_string()
        };
        let mut envelope = Envelope::new(Resp::Err, started);
        envelope.error = Some(ErrorInfo {
            kind: err.kind().to_string(),
            message,
        });
        if let TablekitError::Validation(errors) = err {
            envelope.errors = Some(errors.clone());
        }
        envelope
    }

    pub fn with_rows(mut self, rows: Vec<Record>) -> Self {
        self.count = rows.len() as u64;
        self.row = Some(rows);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn is_err(&self) -> bool {
        self.resp == Resp::Err
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
