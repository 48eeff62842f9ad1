/// Schema Introspection Module
///
/// This module describes table columns in the `{Field, Type, Null, Key, Extra,
/// Default}` shape used by the schema cache. SQLite does not have a single
/// `DESCRIBE` statement, so the description is assembled from
/// `pragma_table_info`, the unique indexes of the table and the rowid-alias
/// rule for `INTEGER PRIMARY KEY` columns.
use crate::core::{Result, TablekitError};
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};

/// Role a column plays in the table's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Primary,
    Unique,
    None,
}

impl KeyRole {
    fn as_describe(&self) -> &'static str {
        match self {
            KeyRole::Primary => "PRI",
            KeyRole::Unique => "UNI",
            KeyRole::None => "",
        }
    }

    fn from_describe(key: &str) -> Self {
        match key {
            "PRI" => KeyRole::Primary,
            "UNI" => KeyRole::Unique,
            _ => KeyRole::None,
        }
    }
}

/// Metadata for one column, immutable once fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "DescribeRow", from = "DescribeRow")]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Declared type as written in the table definition
    pub sql_type: String,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// Primary / unique / plain
    pub key_role: KeyRole,
    /// Whether the database assigns the value on insert
    pub auto_increment: bool,
    /// Default value expression (if any)
    pub default_value: Option<String>,
}

impl ColumnDescriptor {
    pub fn is_primary(&self) -> bool {
        self.key_role == KeyRole::Primary
    }

    pub fn is_datetime(&self) -> bool {
        self.sql_type.trim().eq_ignore_ascii_case("datetime")
    }

    /// Columns a caller may write: neither primary key nor auto-increment.
    pub fn is_writable(&self) -> bool {
        !self.is_primary() && !self.auto_increment
    }

    /// Creates a column from a `pragma_table_info` row
    /// (`cid, name, type, notnull, dflt_value, pk`).
    fn from_pragma_row(row: &Row) -> rusqlite::Result<Self> {
        let notnull: bool = row.get(3)?;
        let pk: i64 = row.get(5)?;
        Ok(ColumnDescriptor {
            name: row.get(1)?,
            sql_type: row.get(2)?,
            nullable: !notnull && pk == 0,
            key_role: if pk > 0 { KeyRole::Primary } else { KeyRole::None },
            auto_increment: false,
            default_value: row.get(4)?,
        })
    }
}

/// Wire shape of a cached column, mirroring a MySQL `DESCRIBE` row
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescribeRow {
    #[serde(rename = "Field")]
    field: String,
    #[serde(rename = "Type")]
    r#type: String,
    #[serde(rename = "Null")]
    null: String,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Extra")]
    extra: String,
    #[serde(rename = "Default")]
    default: Option<String>,
}

impl From<ColumnDescriptor> for DescribeRow {
    fn from(col: ColumnDescriptor) -> Self {
        DescribeRow {
            field: col.name,
            r#type: col.sql_type,
            null: if col.nullable { "YES" } else { "NO" }.to_string(),
            key: col.key_role.as_describe().to_string(),
            extra: if col.auto_increment { "auto_increment" } else { "" }.to_string(),
            default: col.default_value,
        }
    }
}

impl From<DescribeRow> for ColumnDescriptor {
    fn from(row: DescribeRow) -> Self {
        ColumnDescriptor {
            name: row.field,
            sql_type: row.r#type,
            nullable: row.null.eq_ignore_ascii_case("YES"),
            key_role: KeyRole::from_describe(&row.key),
            auto_increment: row.extra.contains("auto_increment"),
            default_value: row.default,
        }
    }
}

/// Source of column metadata for a table.
///
/// The schema cache only talks to the database through this trait, which
/// lets tests count round-trips.
pub trait TableIntrospector {
    /// Returns the ordered columns of `table`. The name has already passed
    /// the identifier check.
    fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>>;
}

impl TableIntrospector for Connection {
    fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let mut columns = get_table_columns(self, table)?;
        if columns.is_empty() {
            return Err(TablekitError::UnknownTable(table.to_string()));
        }

        let pk_count = columns.iter().filter(|c| c.is_primary()).count();
        for col in columns.iter_mut() {
            // a lone INTEGER PRIMARY KEY aliases the rowid
            if col.is_primary() && pk_count == 1 && col.sql_type.eq_ignore_ascii_case("INTEGER") {
                col.auto_increment = true;
            }
        }

        for unique_col in get_unique_columns(self, table)? {
            if let Some(col) = columns.iter_mut().find(|c| c.name == unique_col) {
                if col.key_role == KeyRole::None {
                    col.key_role = KeyRole::Unique;
                }
            }
        }

        Ok(columns)
    }
}

/// Helper function to retrieve column information for a specific table
fn get_table_columns(conn: &Connection, table_name: &str) -> Result<Vec<ColumnDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
    )?;
    let column_iter = stmt.query_map([table_name], |row| ColumnDescriptor::from_pragma_row(row))?;

    let mut columns = Vec::new();
    for column_result in column_iter {
        columns.push(column_result?);
    }
    Ok(columns)
}

/// Helper function to retrieve the columns covered by single-column unique indexes
fn get_unique_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND origin != 'pk'",
    )?;
    let index_names = stmt
        .query_map([table_name], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut unique = Vec::new();
    for index_name in index_names {
        let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1)")?;
        let cols = info
            .query_map([&index_name], |row| row.get::<_, Option<String>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if let [Some(col)] = cols.as_slice() {
            unique.push(col.clone());
        }
    }
    Ok(unique)
}

/// Names of the user tables in the database, sorted. SQLite's internal
/// tables are left out.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup_test_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE users (
                idusers INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(80) NOT NULL,
                email TEXT UNIQUE,
                created_at DATETIME NOT NULL,
                age INTEGER DEFAULT 18
            );
            CREATE TABLE tags (
                code TEXT PRIMARY KEY,
                label TEXT
            );
            CREATE TABLE post_tags (
                post_id INTEGER NOT NULL,
                tag_code TEXT NOT NULL,
                PRIMARY KEY (post_id, tag_code)
            );
        ",
        )
    }

    #[test]
    fn test_column_metadata() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_schema(&conn).unwrap();

        let columns = conn.describe_columns("users").unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["idusers", "name", "email", "created_at", "age"]);

        assert!(columns[0].is_primary());
        assert!(columns[0].auto_increment);
        assert!(!columns[0].nullable);

        assert_eq!(columns[1].sql_type, "VARCHAR(80)");
        assert!(!columns[1].nullable);

        assert_eq!(columns[2].key_role, KeyRole::Unique);
        assert!(columns[2].nullable);

        assert!(columns[3].is_datetime());
        assert_eq!(columns[4].default_value.as_deref(), Some("18"));
    }

    #[test]
    fn test_list_tables_skips_internal_tables() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_schema(&conn).unwrap();
        conn.execute("INSERT INTO users (name, created_at) VALUES ('a', 'now')", [])
            .unwrap();

        assert_eq!(list_tables(&conn).unwrap(), vec!["post_tags", "tags", "users"]);
    }

    #[test]
    fn test_text_and_composite_keys_are_not_auto_increment() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_schema(&conn).unwrap();

        let tags = conn.describe_columns("tags").unwrap();
        assert!(tags[0].is_primary());
        assert!(!tags[0].auto_increment);

        let post_tags = conn.describe_columns("post_tags").unwrap();
        assert!(post_tags.iter().all(|c| c.is_primary() && !c.auto_increment));
    }

    #[test]
    fn test_unknown_table() {
        let conn = Connection::open_in_memory().unwrap();
        match conn.describe_columns("missing") {
            Err(TablekitError::UnknownTable(name)) => assert_eq!(name, "missing"),
            other => panic!("Expected UnknownTable, got {:?}", other),
        }
    }

    #[test]
    fn test_describe_row_shape() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_schema(&conn).unwrap();
        let columns = conn.describe_columns("users").unwrap();

        let json = serde_json::to_value(&columns[0]).unwrap();
        assert_eq!(json["Field"], "idusers");
        assert_eq!(json["Key"], "PRI");
        assert_eq!(json["Null"], "NO");
        assert_eq!(json["Extra"], "auto_increment");

        let back: Vec<ColumnDescriptor> =
            serde_json::from_str(&serde_json::to_string(&columns).unwrap()).unwrap();
        assert_eq!(back, columns);
    }
}
