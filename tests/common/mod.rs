//! Shared fixture for integration tests: a temporary file database with a
//! small shop schema and a schema cache directory beside it.
#![allow(dead_code)]

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tablekit::config::Config;
use tablekit::{EngineContext, TableManager};
use tempfile::TempDir;

pub const SHOP_SCHEMA: &str = "
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
        total REAL
    );
    CREATE TABLE customers (
        idcustomers INTEGER PRIMARY KEY,
        company TEXT
    );
";

pub struct Shop {
    pub dir: TempDir,
    pub manager: TableManager,
}

impl Shop {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("shop.db");
        Connection::open(&db_path).unwrap().execute_batch(SHOP_SCHEMA).unwrap();

        let mut config = Config::new(&db_path);
        config.cache.dir = Some(dir.path().join("cache"));
        let ctx = EngineContext::new(config).unwrap();
        Shop {
            dir,
            manager: TableManager::new(Arc::new(ctx)),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("shop.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn conn(&self) -> Connection {
        Connection::open(self.db_path()).unwrap()
    }

    pub fn count(&self, table: &str) -> i64 {
        self.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }
}

/// Writes a config file for the CLI pointing at `db_path`.
pub fn write_config(dir: &Path, db_path: &Path) -> PathBuf {
    let path = dir.join("tablekit.toml");
    let content = format!(
        "[database]\npath = \"{}\"\n\n[cache]\ndir = \"{}\"\n\n[validation.users.email]\ntype = \"email\"\n",
        db_path.display(),
        dir.join("cache").display()
    );
    std::fs::write(&path, content).unwrap();
    path
}
