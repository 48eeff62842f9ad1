//! Explicitly constructed engine state shared by every table operation.
use crate::config::Config;
use crate::core::db::ConnectionPool;
use crate::core::Result;
use crate::schema_cache::SchemaCache;
use crate::validator::{FieldValidator, Rule};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::debug;

/// Configuration, connection pool, schema cache, validation rules and the
/// debug flag, created once and passed to the executors.
#[derive(Debug)]
pub struct EngineContext {
    config: Config,
    pool: Arc<ConnectionPool>,
    schema_cache: SchemaCache,
    validator: RwLock<FieldValidator>,
    debug_mode: AtomicBool,
}

impl EngineContext {
    /// Builds the context, loading validation rules from the config.
    ///
    /// # Errors
    ///
    /// `TablekitError::Config` for an invalid configuration or a malformed
    /// validation rule.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let mut validator = FieldValidator::new();
        for (table, fields) in &config.validation {
            validator.add_config_rules(table, fields)?;
        }

        let schema_cache = SchemaCache::new(config.cache.resolved_dir(), config.cache.ttl());
        debug!(
            db = ?config.database.path,
            tables_with_rules = config.validation.len(),
            "engine context ready"
        );

        Ok(EngineContext {
            pool: ConnectionPool::new(config.database.clone()),
            debug_mode: AtomicBool::new(config.debug_mode),
            schema_cache,
            validator: RwLock::new(validator),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    pub fn validator(&self) -> RwLockReadGuard<'_, FieldValidator> {
        self.validator.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Relaxed)
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.debug_mode.store(enabled, Ordering::Relaxed);
    }

    /// Replaces the rules of `table`.
    pub fn add_rules<I, F>(&self, table: &str, field_rules: I)
    where
        I: IntoIterator<Item = (F, Vec<Rule>)>,
        F: Into<String>,
    {
        self.validator
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_rules(table, field_rules);
    }

    pub fn set_messages<I, K, V>(&self, messages: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.validator
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_messages(messages);
    }
}
