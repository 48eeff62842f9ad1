//! Table description cache.
//!
//! Column metadata is kept in memory and mirrored to one JSON file per table
//! (`<table>_description.json`). Entries older than the TTL are refetched.
//! This is also the single place where table names are checked before they
//! can reach SQL text.
use crate::core::db::{ColumnDescriptor, TableIntrospector};
use crate::core::{Result, TablekitError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("identifier pattern compiles"));

const CACHE_FILE_SUFFIX: &str = "_description.json";

/// Shared, immutable column list of one table
pub type SchemaRef = Arc<Vec<ColumnDescriptor>>;

pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Rejects any name that is not `[A-Za-z0-9_]+`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(TablekitError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    columns: SchemaRef,
    loaded_at: Instant,
}

/// Process-wide cache of table descriptions.
#[derive(Debug)]
pub struct SchemaCache {
    entries: RwLock<HashMap<String, Entry>>,
    dir: Option<PathBuf>,
    ttl: Duration,
}

impl SchemaCache {
    /// Cache mirrored to files under `dir`.
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        SchemaCache {
            entries: RwLock::new(HashMap::new()),
            dir: Some(dir.into()),
            ttl,
        }
    }

    /// Cache without a file mirror.
    pub fn in_memory(ttl: Duration) -> Self {
        SchemaCache {
            entries: RwLock::new(HashMap::new()),
            dir: None,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the ordered columns of `table`.
    ///
    /// Lookup order is memory, then a cache file younger than the TTL, then
    /// `source`. With `force` both caches are bypassed and refreshed. A
    /// failure to write the cache file is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// `TablekitError::InvalidIdentifier` for malformed names, before any
    /// lookup; errors from `source` are passed through.
    pub fn describe(
        &self,
        source: &dyn TableIntrospector,
        table: &str,
        force: bool,
    ) -> Result<SchemaRef> {
        validate_identifier(table)?;

        if !force {
            if let Some(columns) = self.read_memory(table) {
                debug!(table, "schema cache hit (memory)");
                return Ok(columns);
            }
            if let Some(columns) = self.read_file(table) {
                debug!(table, "schema cache hit (file)");
                let columns = Arc::new(columns);
                self.store_memory(table, Arc::clone(&columns));
                return Ok(columns);
            }
        }

        debug!(table, force, "describing table");
        let columns = Arc::new(source.describe_columns(table)?);
        self.store_memory(table, Arc::clone(&columns));
        if let Err(e) = self.write_file(table, &columns) {
            warn!(table, error = %e, "schema cache file not written");
        }
        Ok(columns)
    }

    /// Drops one table's entries, or every entry when `table` is `None`,
    /// from memory and disk.
    pub fn clear(&self, table: Option<&str>) -> Result<()> {
        match table {
            Some(table) => {
                validate_identifier(table)?;
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(table);
                if let Some(path) = self.cache_file(table) {
                    remove_file(&path);
                }
            }
            None => {
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                if let Some(dir) = &self.dir {
                    let listing = match fs::read_dir(dir) {
                        Ok(listing) => listing,
                        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                        Err(e) => return Err(e.into()),
                    };
                    for entry in listing.flatten() {
                        let path = entry.path();
                        let is_cache_file = path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map_or(false, |n| n.ends_with(CACHE_FILE_SUFFIX));
                        if is_cache_file {
                            remove_file(&path);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Tables currently held in memory, sorted.
    pub fn cached_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    fn cache_file(&self, table: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}{}", table, CACHE_FILE_SUFFIX)))
    }

    fn read_memory(&self, table: &str) -> Option<SchemaRef> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(table)
            .filter(|entry| entry.loaded_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.columns))
    }

    fn store_memory(&self, table: &str, columns: SchemaRef) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                table.to_string(),
                Entry {
                    columns,
                    loaded_at: Instant::now(),
                },
            );
    }

    fn read_file(&self, table: &str) -> Option<Vec<ColumnDescriptor>> {
        let path = self.cache_file(table)?;
        let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        // a timestamp in the future counts as fresh
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= self.ttl {
            return None;
        }
        let content = fs::read(&path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(columns) => Some(columns),
            Err(e) => {
                warn!(table, error = %e, "ignoring unreadable schema cache file");
                None
            }
        }
    }

    fn write_file(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<()> {
        let Some(path) = self.cache_file(table) else {
            return Ok(());
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_vec_pretty(columns)?;
            fs::write(&path, json)
        };
        write().map_err(|e| TablekitError::CacheWrite(format!("{}: {}", path.display(), e)))
    }
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "schema cache file removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "schema cache file not removed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::KeyRole;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Introspector that counts database round-trips.
    struct CountingSource {
        calls: Cell<usize>,
    }

    impl CountingSource {
        fn new() -> Self {
            CountingSource { calls: Cell::new(0) }
        }
    }

    impl TableIntrospector for CountingSource {
        fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
            self.calls.set(self.calls.get() + 1);
            Ok(vec![
                ColumnDescriptor {
                    name: format!("id{}", table),
                    sql_type: "INTEGER".to_string(),
                    nullable: false,
                    key_role: KeyRole::Primary,
                    auto_increment: true,
                    default_value: None,
                },
                ColumnDescriptor {
                    name: "name".to_string(),
                    sql_type: "TEXT".to_string(),
                    nullable: true,
                    key_role: KeyRole::None,
                    auto_increment: false,
                    default_value: None,
                },
            ])
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_identifier_check() {
        assert!(validate_identifier("users_2024").is_ok());
        for bad in ["", "users;", "users name", "users`", "public.users", "ü"] {
            assert!(
                matches!(validate_identifier(bad), Err(TablekitError::InvalidIdentifier(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_invalid_name_never_reaches_source() {
        let source = CountingSource::new();
        let cache = SchemaCache::in_memory(HOUR);
        assert!(cache.describe(&source, "users; DROP TABLE x", false).is_err());
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn test_second_describe_is_cached() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new();
        let cache = SchemaCache::new(dir.path(), HOUR);

        let first = cache.describe(&source, "users", false).unwrap();
        let second = cache.describe(&source, "users", false).unwrap();

        assert_eq!(source.calls.get(), 1);
        assert_eq!(
            serde_json::to_vec(&*first).unwrap(),
            serde_json::to_vec(&*second).unwrap()
        );
    }

    #[test]
    fn test_force_always_requeries() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new();
        let cache = SchemaCache::new(dir.path(), HOUR);

        cache.describe(&source, "users", false).unwrap();
        cache.describe(&source, "users", true).unwrap();
        cache.describe(&source, "users", true).unwrap();
        assert_eq!(source.calls.get(), 3);
    }

    #[test]
    fn test_file_cache_shared_between_instances() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new();

        SchemaCache::new(dir.path(), HOUR)
            .describe(&source, "users", false)
            .unwrap();
        assert!(dir.path().join("users_description.json").is_file());

        let fresh = SchemaCache::new(dir.path(), HOUR);
        let columns = fresh.describe(&source, "users", false).unwrap();
        assert_eq!(source.calls.get(), 1);
        assert_eq!(columns[0].name, "idusers");
        assert_eq!(fresh.cached_tables(), vec!["users".to_string()]);
    }

    #[test]
    fn test_expired_entries_are_refetched() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new();
        let cache = SchemaCache::new(dir.path(), Duration::ZERO);

        cache.describe(&source, "users", false).unwrap();
        cache.describe(&source, "users", false).unwrap();
        assert_eq!(source.calls.get(), 2);
    }

    #[test]
    fn test_clear_one_and_all() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new();
        let cache = SchemaCache::new(dir.path(), HOUR);

        cache.describe(&source, "users", false).unwrap();
        cache.describe(&source, "orders", false).unwrap();

        cache.clear(Some("users")).unwrap();
        assert!(!dir.path().join("users_description.json").exists());
        assert!(dir.path().join("orders_description.json").exists());
        assert_eq!(cache.cached_tables(), vec!["orders".to_string()]);

        cache.clear(None).unwrap();
        assert!(cache.cached_tables().is_empty());
        assert!(!dir.path().join("orders_description.json").exists());

        cache.describe(&source, "orders", false).unwrap();
        assert_eq!(source.calls.get(), 3);
    }

    #[test]
    fn test_unwritable_dir_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let source = CountingSource::new();
        let cache = SchemaCache::new(&blocker, HOUR);
        let columns = cache.describe(&source, "users", false).unwrap();
        assert_eq!(columns.len(), 2);

        // memory still serves the entry
        cache.describe(&source, "users", false).unwrap();
        assert_eq!(source.calls.get(), 1);
    }
}
