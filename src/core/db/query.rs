/// Query Execution Module
///
/// This module runs parameterized SQL on a single connection and maps result
/// rows into ordered [`Record`]s. Values are always bound, never formatted
/// into the statement text.
use crate::core::{Record, Result, Value};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

/// Represents the result of a SQL query execution
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Column names from the query result
    pub columns: Vec<String>,
    /// Rows keyed by column name, in column order
    pub rows: Vec<Record>,
    /// Number of rows returned
    pub row_count: usize,
}

impl QueryResult {
    /// Creates a new QueryResult from column names and row data
    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        let row_count = rows.len();
        QueryResult {
            columns,
            rows,
            row_count,
        }
    }
}

/// Query execution service that operates on a database connection
pub struct QueryExecutor<'a> {
    connection: &'a Connection,
}

impl<'a> QueryExecutor<'a> {
    /// Creates a new QueryExecutor for the given connection
    pub fn new(connection: &'a Connection) -> Self {
        QueryExecutor { connection }
    }

    /// Executes a statement and returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// Returns `TablekitError::Database` if the statement cannot be prepared
    /// or fails while running.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        debug!(sql, params = params.len(), "execute");
        let mut stmt = self.connection.prepare(sql)?;
        let affected = stmt.execute(params_from_iter(params.iter()))?;
        Ok(affected)
    }

    /// Executes a query and collects every row.
    ///
    /// Duplicate column names (natural joins over `*`) keep the first value
    /// under the shared name.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        debug!(sql, params = params.len(), "query");
        let mut stmt = self.connection.prepare(sql)?;

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let mut record = Record::new();
                for (i, name) in columns.iter().enumerate() {
                    if !record.contains_key(name) {
                        record.insert(name.clone(), Value::from_sql_ref(row.get_ref(i)?));
                    }
                }
                Ok(record)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(QueryResult::new(columns, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TablekitError;
    use rusqlite::Connection;

    fn setup_test_table(conn: &Connection) {
        conn.execute_batch(
            "
            CREATE TABLE test (
                id INTEGER PRIMARY KEY,
                name TEXT,
                value REAL,
                active BOOLEAN DEFAULT 1
            );
            INSERT INTO test (name, value) VALUES ('Alice', 123.45);
            INSERT INTO test (name, value) VALUES ('Bob', 678.90);
            INSERT INTO test (name, value) VALUES (NULL, NULL);
        ",
        )
        .unwrap();
    }

    #[test]
    fn test_query_execution() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);

        let executor = QueryExecutor::new(&conn);
        let result = executor.query("SELECT * FROM test ORDER BY id", &[]).unwrap();

        assert_eq!(result.columns, vec!["id", "name", "value", "active"]);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows[0].get("name"), Some(&Value::Text("Alice".into())));
        assert_eq!(result.rows[0].get("value"), Some(&Value::Float(123.45)));
        assert_eq!(result.rows[2].get("name"), Some(&Value::Null));
        assert_eq!(result.rows[2].get("active"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_bound_parameters() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);
        let executor = QueryExecutor::new(&conn);

        let hostile = Value::from("Alice' OR '1'='1");
        let result = executor
            .query("SELECT id FROM test WHERE name = ?", &[hostile])
            .unwrap();
        assert_eq!(result.row_count, 0);

        let affected = executor
            .execute("UPDATE test SET value = ? WHERE name = ?", &[Value::Int(1), Value::from("Bob")])
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[test]
    fn test_query_error_handling() {
        let conn = Connection::open_in_memory().unwrap();

        let executor = QueryExecutor::new(&conn);
        match executor.query("SELECT * FROM nonexistent_table", &[]) {
            Err(TablekitError::Database(e)) => assert!(e.to_string().contains("no such table")),
            other => panic!("Expected Database error, got {:?}", other),
        }
    }

    #[test]
    fn test_blob_handling() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE blobs (id INTEGER, data BLOB)", []).unwrap();
        conn.execute("INSERT INTO blobs VALUES (1, X'48656C6C6F')", []).unwrap();

        let result = QueryExecutor::new(&conn)
            .query("SELECT data FROM blobs WHERE id = ?", &[Value::Int(1)])
            .unwrap();
        assert_eq!(result.rows[0].get("data"), Some(&Value::Text("<BLOB: 5 bytes>".into())));
    }
}
