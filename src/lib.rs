// Core infrastructure modules
pub mod config;
pub mod context;
pub mod core;

// Table access layers
pub mod builder;
pub mod envelope;
pub mod schema_cache;
pub mod table_manager;
pub mod validator;

#[cfg(test)]
mod test_utils;

pub use crate::context::EngineContext;
pub use crate::core::{Record, Result, TablekitError, Value};
pub use crate::envelope::{Envelope, Resp};
pub use crate::table_manager::{Session, TableManager};
