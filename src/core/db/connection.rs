/// Connection Management Module
///
/// This module provides a bounded pool of SQLite handles plus the
/// per-handle transaction lifecycle. Capacity counts idle and checked-out
/// handles together; idle handles are probed before reuse and replaced when
/// the probe fails.
use crate::config::DatabaseConfig;
use crate::core::db::query::{QueryExecutor, QueryResult};
use crate::core::{Result, TablekitError, Value};
use rusqlite::Connection;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Represents database transaction states
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TransactionState {
    /// No active transaction (autocommit mode)
    #[default]
    Autocommit,
    /// Transaction in progress
    Transaction,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Connection>,
    in_use: usize,
}

/// Bounded pool of database handles shared by every request.
#[derive(Debug)]
pub struct ConnectionPool {
    config: DatabaseConfig,
    state: Mutex<PoolState>,
    probe: fn(&Connection) -> bool,
}

/// Lightweight liveness probe run on idle handles before reuse.
fn is_alive(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
}

/// Maps a caller-facing charset name to an SQLite text encoding.
fn sqlite_encoding(charset: &str) -> Result<Option<&'static str>> {
    match charset.to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "utf8" | "utf8mb4" | "utf-8" => Ok(Some("UTF-8")),
        "utf16" | "utf-16" => Ok(Some("UTF-16")),
        "utf-16le" | "utf16le" => Ok(Some("UTF-16le")),
        "utf-16be" | "utf16be" => Ok(Some("UTF-16be")),
        other => Err(TablekitError::Config(format!("Unsupported charset: {}", other))),
    }
}

impl ConnectionPool {
    /// Creates an empty pool; handles are opened lazily.
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        Arc::new(ConnectionPool {
            config,
            state: Mutex::new(PoolState::default()),
            probe: is_alive,
        })
    }

    #[cfg(test)]
    fn with_probe(config: DatabaseConfig, probe: fn(&Connection) -> bool) -> Arc<Self> {
        Arc::new(ConnectionPool {
            config,
            state: Mutex::new(PoolState::default()),
            probe,
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.max_pool_size
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out a handle, reusing a live idle one or opening a new one
    /// while capacity allows.
    ///
    /// # Arguments
    ///
    /// * `charset` - Text encoding applied to the handle, `""` for the default
    ///
    /// # Errors
    ///
    /// `TablekitError::PoolExhausted` when every slot is checked out,
    /// `TablekitError::Database` when a new handle cannot be opened.
    pub fn get(self: &Arc<Self>, charset: &str) -> Result<PooledConnection> {
        let encoding = sqlite_encoding(charset)?;

        let reused = {
            let mut state = self.lock();
            let mut found = None;
            while let Some(conn) = state.idle.pop() {
                if (self.probe)(&conn) {
                    found = Some(conn);
                    break;
                }
                warn!("Evicting dead connection to {:?}", self.config.path);
            }
            if found.is_some() || state.idle.len() + state.in_use < self.config.max_pool_size {
                state.in_use += 1;
            } else {
                return Err(TablekitError::PoolExhausted {
                    capacity: self.config.max_pool_size,
                });
            }
            found
        };

        let conn = match reused {
            Some(conn) => conn,
            None => match self.open() {
                Ok(conn) => conn,
                Err(e) => {
                    self.lock().in_use -= 1;
                    return Err(e);
                }
            },
        };

        let pooled = PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            transaction_state: TransactionState::Autocommit,
            broken: false,
        };
        if let Some(encoding) = encoding {
            pooled.execute_batch(&format!("PRAGMA encoding = '{}'", encoding))?;
        }
        Ok(pooled)
    }

    fn open(&self) -> Result<Connection> {
        debug!("Opening connection to {:?}", self.config.path);
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(self.config.busy_timeout())?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    fn release(&self, conn: Option<Connection>) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if let Some(conn) = conn {
            state.idle.push(conn);
        }
    }

    /// Drops every idle handle. Checked-out handles close when released.
    pub fn close_all(&self) {
        let mut state = self.lock();
        debug!("Closing {} idle connection(s)", state.idle.len());
        state.idle.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            capacity: self.config.max_pool_size,
        }
    }
}

/// A checked-out handle; returns to the pool when dropped.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    transaction_state: TransactionState,
    broken: bool,
}

impl PooledConnection {
    fn conn(&self) -> &Connection {
        // only taken in Drop
        self.conn.as_ref().expect("connection present until drop")
    }

    /// Gets the current transaction state
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state
    }

    /// Starts a transaction on this handle.
    ///
    /// # Errors
    ///
    /// `TablekitError::Transaction` if one is already in progress.
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction_state != TransactionState::Autocommit {
            return Err(TablekitError::Transaction("Transaction already in progress".to_string()));
        }
        self.conn().execute_batch("BEGIN")?;
        self.transaction_state = TransactionState::Transaction;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.transaction_state != TransactionState::Transaction {
            return Err(TablekitError::Transaction("No transaction in progress".to_string()));
        }
        self.conn().execute_batch("COMMIT")?;
        self.transaction_state = TransactionState::Autocommit;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.transaction_state != TransactionState::Transaction {
            return Err(TablekitError::Transaction("No transaction in progress".to_string()));
        }
        self.conn().execute_batch("ROLLBACK")?;
        self.transaction_state = TransactionState::Autocommit;
        Ok(())
    }

    /// Row id of the most recent successful insert on this handle.
    pub fn last_insert_id(&self) -> i64 {
        self.conn().last_insert_rowid()
    }

    /// Executes a statement with bound values and returns the affected rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        QueryExecutor::new(self.conn()).execute(sql, params)
    }

    /// Runs a query with bound values and collects every row.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        QueryExecutor::new(self.conn()).query(sql, params)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn().execute_batch(sql).map_err(TablekitError::from)
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.transaction_state == TransactionState::Transaction {
            warn!("Connection released with an open transaction, rolling back");
            if self.execute_batch("ROLLBACK").is_err() {
                self.broken = true;
            }
        }
        let conn = self.conn.take().filter(|_| !self.broken);
        self.pool.release(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_config(dir: &TempDir, size: usize) -> DatabaseConfig {
        let mut config = DatabaseConfig::new(dir.path().join("pool.db"));
        config.max_pool_size = size;
        config
    }

    #[test]
    fn test_handles_are_reused() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(pool_config(&dir, 2));

        {
            let conn = pool.get("").unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 0, capacity: 2 });

        let _again = pool.get("").unwrap();
        assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1, capacity: 2 });
    }

    #[test]
    fn test_pool_exhausted() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(pool_config(&dir, 2));

        let _a = pool.get("").unwrap();
        let _b = pool.get("").unwrap();
        match pool.get("") {
            Err(TablekitError::PoolExhausted { capacity }) => assert_eq!(capacity, 2),
            other => panic!("Expected PoolExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_dead_idle_handles_are_replaced() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::with_probe(pool_config(&dir, 1), |_| false);

        drop(pool.get("").unwrap());
        assert_eq!(pool.stats().idle, 1);

        // probe rejects the idle handle, a fresh one takes its slot
        let conn = pool.get("").unwrap();
        assert_eq!(conn.query("SELECT 1", &[]).unwrap().row_count, 1);
        assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1, capacity: 1 });
    }

    #[test]
    fn test_transaction_state_management() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(pool_config(&dir, 1));
        let mut conn = pool.get("").unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

        conn.begin_transaction().unwrap();
        assert_eq!(conn.transaction_state(), TransactionState::Transaction);
        assert!(conn.begin_transaction().is_err());

        conn.execute("INSERT INTO t (v) VALUES (?1)", &[Value::from("a")]).unwrap();
        conn.rollback().unwrap();
        assert_eq!(conn.transaction_state(), TransactionState::Autocommit);
        assert!(conn.commit().is_err());

        let rows = conn.query("SELECT COUNT(*) AS n FROM t", &[]).unwrap();
        assert_eq!(rows.rows[0].get("n"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_open_transaction_rolled_back_on_release() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(pool_config(&dir, 1));
        {
            let mut conn = pool.get("").unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
            conn.begin_transaction().unwrap();
            conn.execute("INSERT INTO t DEFAULT VALUES", &[]).unwrap();
        }
        let conn = pool.get("").unwrap();
        assert_eq!(conn.transaction_state(), TransactionState::Autocommit);
        let rows = conn.query("SELECT id FROM t", &[]).unwrap();
        assert_eq!(rows.row_count, 0);
    }

    #[test]
    fn test_charset_handling() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(pool_config(&dir, 1));

        assert!(matches!(pool.get("latin1"), Err(TablekitError::Config(_))));
        assert_eq!(pool.stats().in_use, 0);

        let conn = pool.get("utf8mb4").unwrap();
        let rows = conn.query("PRAGMA encoding", &[]).unwrap();
        assert_eq!(rows.rows[0].get("encoding"), Some(&Value::Text("UTF-8".into())));
    }

    #[test]
    fn test_connection_error_handling() {
        let pool = ConnectionPool::new(DatabaseConfig::new("/nonexistent/path/database.db"));
        match pool.get("") {
            Err(TablekitError::Database(_)) => {}
            other => panic!("Expected Database error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(pool.stats().in_use, 0);
    }
}
