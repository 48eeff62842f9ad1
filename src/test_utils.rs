/// # Test Utilities Module
///
/// Isolated engine fixtures for unit tests: every [`TestEngine`] owns a
/// temporary directory holding a file database with the fixture schema and
/// the schema cache files.
use crate::config::Config;
use crate::context::EngineContext;
use crate::table_manager::TableManager;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// `users` and `orders` share `idusers`; `customers` shares nothing with
/// `orders`; `tags` names its key differently from `id<table>`.
pub const FIXTURE_SCHEMA: &str = "
    CREATE TABLE users (
        idusers INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT UNIQUE,
        created_at DATETIME NOT NULL,
        updated_at DATETIME
    );
    CREATE TABLE orders (
        idorders INTEGER PRIMARY KEY,
        idusers INTEGER,
        total REAL,
        status TEXT
    );
    CREATE TABLE customers (
        idcustomers INTEGER PRIMARY KEY,
        company TEXT
    );
    CREATE TABLE tags (
        tag_id INTEGER PRIMARY KEY,
        label TEXT
    );
";

pub struct TestEngine {
    pub ctx: Arc<EngineContext>,
    dir: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = dir.path().join("fixture.db");
        Connection::open(&db_path)
            .and_then(|conn| conn.execute_batch(FIXTURE_SCHEMA))
            .expect("Failed to create fixture schema");

        let mut config = Config::new(&db_path);
        config.cache.dir = Some(dir.path().join("cache"));
        adjust(&mut config);

        let ctx = Arc::new(EngineContext::new(config).expect("Failed to build engine context"));
        TestEngine { ctx, dir }
    }

    pub fn manager(&self) -> TableManager {
        TableManager::new(Arc::clone(&self.ctx))
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("fixture.db")
    }

    /// Separate handle for assertions, outside the pool.
    pub fn raw(&self) -> Connection {
        Connection::open(self.db_path()).expect("Failed to open fixture database")
    }

    pub fn count(&self, table: &str) -> i64 {
        self.raw()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .expect("Failed to count rows")
    }
}
