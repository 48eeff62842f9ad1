/// Core Module for Tablekit
///
/// This module contains the shared infrastructure of the table-access engine:
/// the error taxonomy, the tagged payload values and the database layer
/// (pooled connections, introspection and query execution).

pub mod db;
pub mod error;
pub mod value;

// Re-export commonly used types for convenience
pub use error::{FieldErrors, Result, TablekitError};
pub use value::{Record, Value};
