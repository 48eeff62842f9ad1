/// Database Module
///
/// This module provides the database layer of the engine, organized into
/// focused submodules.
///
/// ## Architecture
///
/// - **Connection Management** (`connection.rs`): bounded handle pool, liveness probing and transactions
/// - **Schema Introspection** (`schema.rs`): column metadata in the `DESCRIBE` shape
/// - **Query Execution** (`query.rs`): parameterized execution and row mapping
///
/// ## Error Handling
///
/// All database operations use the standardized `TablekitError` type for consistent error propagation.
pub mod connection;
pub mod query;
pub mod schema;

pub use connection::*;
pub use query::*;
pub use schema::*;
