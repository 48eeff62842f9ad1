//! SQL assembly for the generic table operations.
//!
//! Every function here is pure: it takes the described columns of the
//! involved tables plus the caller's request and returns SQL text with `?`
//! placeholders and the values to bind. Identifiers only come from the
//! described schemas and are double-quoted; values never enter the SQL text.
use crate::core::db::ColumnDescriptor;
use crate::core::{Record, Result, TablekitError, Value};
use crate::schema_cache::{is_identifier, validate_identifier};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

static JOIN_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bJOIN\s+["`\[]?([A-Za-z0-9_]+)"#).expect("join pattern compiles")
});

/// SQL text plus the values bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<Value>,
}

/// Allowed comparison operators for ad-hoc filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

impl FromStr for CompareOp {
    type Err = TablekitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "=" | "==" => Ok(CompareOp::Eq),
            "!=" | "<>" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            "LIKE" => Ok(CompareOp::Like),
            _ => Err(TablekitError::InvalidOperator(s.to_string())),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Extra condition `field <op> value`
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Builds a filter from a caller-supplied operator string.
    pub fn parse(field: impl Into<String>, op: &str, value: impl Into<Value>) -> Result<Self> {
        Ok(Filter::new(field, op.parse()?, value))
    }
}

/// `ORDER BY` target; `column` may be `table.column`
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            descending: true,
        }
    }
}

/// Multi-table select request
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Tables chained with `NATURAL JOIN`, in order
    pub tables: Vec<String>,
    /// Equality conditions, field to value
    pub data: Record,
    pub filters: Vec<Filter>,
    /// Trusted join fragment appended after the natural joins
    pub custom_joins: Option<String>,
    /// Trusted fragment appended after `AS subquery`
    pub subquery: Option<String>,
    /// Selected fields, `column` or `table.column`; empty selects `*`
    pub fields: Vec<String>,
    pub use_aliases: bool,
    pub limit: Option<u64>,
    pub order_by: Option<OrderBy>,
}

impl QueryRequest {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QueryRequest {
            tables: tables.into_iter().map(Into::into).collect(),
            data: Record::new(),
            filters: Vec::new(),
            custom_joins: None,
            subquery: None,
            fields: Vec::new(),
            use_aliases: true,
            limit: None,
            order_by: None,
        }
    }

    pub fn data(mut self, data: Record) -> Self {
        self.data = data;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn custom_joins(mut self, joins: impl Into<String>) -> Self {
        self.custom_joins = Some(joins.into());
        self
    }

    pub fn subquery(mut self, fragment: impl Into<String>) -> Self {
        self.subquery = Some(fragment.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn use_aliases(mut self, enabled: bool) -> Self {
        self.use_aliases = enabled;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    /// Tables named after `JOIN` inside the custom join fragment.
    pub fn join_tables(&self) -> Vec<String> {
        self.custom_joins.as_deref().map(join_tables).unwrap_or_default()
    }
}

/// A described table taking part in a statement
#[derive(Debug, Clone, Copy)]
pub struct TableColumns<'a> {
    pub name: &'a str,
    pub columns: &'a [ColumnDescriptor],
}

impl<'a> TableColumns<'a> {
    pub fn new(name: &'a str, columns: &'a [ColumnDescriptor]) -> Self {
        TableColumns { name, columns }
    }

    fn has(&self, column: &str) -> bool {
        find_column(self.columns, column).is_some()
    }
}

/// Double-quotes a name that already passed the identifier check.
pub fn quote_ident(name: &str) -> String {
    debug_assert!(is_identifier(name), "unchecked identifier {:?}", name);
    format!("\"{}\"", name)
}

/// Schema column called `name`; columns whose own name would not pass the
/// identifier check are never matched.
fn find_column<'a>(columns: &'a [ColumnDescriptor], name: &str) -> Option<&'a ColumnDescriptor> {
    columns
        .iter()
        .find(|c| c.name == name && is_identifier(&c.name))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Deterministic alias: first letter of the table plus four hex digits of an
/// FNV-1a hash over `table#position`.
pub fn table_alias(table: &str, position: usize) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    let key = format!("{}#{}", table, position);
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let first = table
        .chars()
        .next()
        .filter(|c| c.is_ascii_alphabetic())
        .unwrap_or('t')
        .to_ascii_lowercase();
    format!("{}{:04x}", first, hash & 0xffff)
}

/// Tables referenced as `JOIN <table>` in a join fragment, deduplicated.
pub fn join_tables(fragment: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    JOIN_TABLE
        .captures_iter(fragment)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Rejects statement separators and comments in trusted fragments.
fn check_fragment(fragment: &str) -> Result<()> {
    if fragment.contains(';') || fragment.contains("--") || fragment.contains("/*") {
        return Err(TablekitError::InvalidIdentifier(format!(
            "unsafe SQL fragment: {}",
            fragment
        )));
    }
    Ok(())
}

/// Builds `INSERT INTO t (...) VALUES (?, ...)`.
///
/// Keeps writable columns supplied in `data` and stamps every NOT NULL
/// `datetime` column the caller left out with `now`.
pub fn build_insert(
    table: &str,
    columns: &[ColumnDescriptor],
    data: &Record,
    now: &str,
) -> Result<Statement> {
    validate_identifier(table)?;
    let mut names = Vec::new();
    let mut values = Vec::new();

    for col in columns.iter().filter(|c| c.is_writable() && is_identifier(&c.name)) {
        if data.is_set(&col.name) {
            names.push(quote_ident(&col.name));
            values.push(data.get(&col.name).cloned().unwrap_or(Value::Null));
        } else if col.is_datetime() && !col.nullable {
            names.push(quote_ident(&col.name));
            values.push(Value::from(now));
        }
    }

    if names.is_empty() {
        return Err(TablekitError::NoValidFields(table.to_string()));
    }

    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            placeholders(values.len())
        ),
        values,
    })
}

/// Builds `UPDATE t SET ... WHERE ...`.
///
/// `datetime` columns whose name starts with `update` are always set to
/// `now`. At least one caller field and one schema-known `where` column are
/// required, so the statement never runs unconditionally.
pub fn build_update(
    table: &str,
    columns: &[ColumnDescriptor],
    data: &Record,
    where_: &Record,
    now: &str,
) -> Result<Statement> {
    validate_identifier(table)?;
    let mut sets = Vec::new();
    let mut values = Vec::new();
    let mut supplied = 0;

    for col in columns.iter().filter(|c| c.is_writable() && is_identifier(&c.name)) {
        if col.is_datetime() && col.name.starts_with("update") {
            sets.push(format!("{} = ?", quote_ident(&col.name)));
            values.push(Value::from(now));
        } else if let Some(value) = data.get(&col.name) {
            sets.push(format!("{} = ?", quote_ident(&col.name)));
            values.push(value.clone());
            supplied += 1;
        }
    }

    if supplied == 0 {
        return Err(TablekitError::NoValidFields(table.to_string()));
    }

    let mut conditions = Vec::new();
    for (key, value) in where_.iter() {
        if let Some(col) = find_column(columns, key) {
            conditions.push(format!("{} = ?", quote_ident(&col.name)));
            values.push(value.clone());
        }
    }

    if conditions.is_empty() {
        return Err(TablekitError::NoValidWhere(table.to_string()));
    }

    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            sets.join(", "),
            conditions.join(" AND ")
        ),
        values,
    })
}

/// Builds `DELETE FROM t WHERE ...` from schema-known `where` columns whose
/// name contains `id`. Returns the accepted predicates alongside.
pub fn build_delete(
    table: &str,
    columns: &[ColumnDescriptor],
    where_: &Record,
) -> Result<(Statement, Record)> {
    validate_identifier(table)?;
    let mut accepted = Record::new();
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    for (key, value) in where_.iter() {
        if !key.to_ascii_lowercase().contains("id") {
            continue;
        }
        if let Some(col) = find_column(columns, key) {
            conditions.push(format!("{} = ?", quote_ident(&col.name)));
            values.push(value.clone());
            accepted.insert(key, value.clone());
        }
    }

    if conditions.is_empty() {
        return Err(TablekitError::NoValidWhere(table.to_string()));
    }

    let statement = Statement {
        sql: format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(table),
            conditions.join(" AND ")
        ),
        values,
    };
    Ok((statement, accepted))
}

/// Builds a single-table `SELECT *` filtered by the schema-known fields of
/// `data`.
pub fn build_select(
    table: &str,
    columns: &[ColumnDescriptor],
    data: &Record,
    order_by: Option<&OrderBy>,
    limit: Option<u64>,
) -> Result<Statement> {
    validate_identifier(table)?;
    let mut sql = format!("SELECT * FROM {}", quote_ident(table));
    let mut values = Vec::new();

    let conditions: Vec<String> = data
        .iter()
        .filter_map(|(key, value)| {
            find_column(columns, key).map(|col| {
                values.push(value.clone());
                format!("{} = ?", quote_ident(&col.name))
            })
        })
        .collect();
    if !conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }

    if let Some(order) = order_by {
        validate_identifier(&order.column)?;
        let col = find_column(columns, &order.column)
            .ok_or_else(|| TablekitError::InvalidIdentifier(order.column.clone()))?;
        sql.push_str(&format!(
            " ORDER BY {}{}",
            quote_ident(&col.name),
            if order.descending { " DESC" } else { "" }
        ));
    }

    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    Ok(Statement { sql, values })
}

/// Resolves caller-supplied column references against the joined tables.
struct Resolver<'a> {
    base: &'a [TableColumns<'a>],
    joined: &'a [TableColumns<'a>],
    aliases: Vec<Option<String>>,
}

impl<'a> Resolver<'a> {
    fn qualifier(&self, position: usize) -> String {
        match &self.aliases[position] {
            Some(alias) => quote_ident(alias),
            None => quote_ident(self.base[position].name),
        }
    }

    /// Expression for a bare column: the first base table owning it
    /// (alias-qualified when aliases are on), else a custom-join table.
    fn column(&self, column: &str) -> Option<String> {
        if !is_identifier(column) {
            return None;
        }
        if let Some(position) = self.base.iter().position(|t| t.has(column)) {
            return Some(match self.aliases[position] {
                Some(_) => format!("{}.{}", self.qualifier(position), quote_ident(column)),
                None => quote_ident(column),
            });
        }
        self.joined
            .iter()
            .any(|t| t.has(column))
            .then(|| quote_ident(column))
    }

    /// Expression for `column` or `table.column`.
    ///
    /// # Errors
    ///
    /// `TablekitError::InvalidIdentifier` for malformed references.
    fn reference(&self, reference: &str) -> Result<Option<String>> {
        match reference.split_once('.') {
            Some((table, column)) => {
                validate_identifier(table)?;
                validate_identifier(column)?;
                if let Some(position) = self
                    .base
                    .iter()
                    .position(|t| t.name == table && t.has(column))
                {
                    return Ok(Some(format!("{}.{}", self.qualifier(position), quote_ident(column))));
                }
                Ok(self
                    .joined
                    .iter()
                    .any(|t| t.name == table && t.has(column))
                    .then(|| format!("{}.{}", quote_ident(table), quote_ident(column))))
            }
            None => {
                validate_identifier(reference)?;
                Ok(self.column(reference))
            }
        }
    }
}

/// Builds the multi-table natural-join select.
///
/// `base` holds the described tables of `request.tables` in order and
/// `joined` the described tables named in the custom join fragment. Tables
/// without common columns degrade to a cross join, as `NATURAL JOIN` does.
pub fn build_select_all(
    request: &QueryRequest,
    base: &[TableColumns<'_>],
    joined: &[TableColumns<'_>],
) -> Result<Statement> {
    if base.is_empty() {
        return Err(TablekitError::InvalidIdentifier("no tables requested".to_string()));
    }
    for table in base.iter().chain(joined) {
        validate_identifier(table.name)?;
    }
    if let Some(fragment) = &request.custom_joins {
        check_fragment(fragment)?;
    }
    if let Some(fragment) = &request.subquery {
        check_fragment(fragment)?;
    }

    let mut taken: HashSet<String> = base
        .iter()
        .chain(joined)
        .map(|t| t.name.to_string())
        .collect();
    let aliases: Vec<Option<String>> = base
        .iter()
        .enumerate()
        .map(|(position, table)| {
            request.use_aliases.then(|| {
                let mut alias = table_alias(table.name, position);
                if taken.contains(&alias) {
                    alias = format!("{}_{}", alias, position);
                }
                taken.insert(alias.clone());
                alias
            })
        })
        .collect();
    let resolver = Resolver { base, joined, aliases };

    let mut selected = Vec::new();
    for field in &request.fields {
        match resolver.reference(field)? {
            Some(expr) => selected.push(expr),
            None => warn!(field = field.as_str(), "dropping unknown select field"),
        }
    }
    let field_list = if selected.is_empty() {
        "*".to_string()
    } else {
        selected.join(", ")
    };

    let mut from = Vec::with_capacity(base.len());
    for (position, table) in base.iter().enumerate() {
        let mut item = quote_ident(table.name);
        if let Some(alias) = &resolver.aliases[position] {
            item.push_str(&format!(" AS {}", quote_ident(alias)));
        }
        from.push(item);
    }
    let mut sql = format!("SELECT {} FROM {}", field_list, from.join(" NATURAL JOIN "));
    if let Some(joins) = &request.custom_joins {
        sql.push(' ');
        sql.push_str(joins.trim());
    }

    let mut conditions = Vec::new();
    let mut values = Vec::new();
    for (field, value) in request.data.iter() {
        if let Some(expr) = resolver.column(field) {
            conditions.push(format!("{} = ?", expr));
            values.push(value.clone());
        }
    }
    for filter in &request.filters {
        let expr = resolver.reference(&filter.field)?.ok_or_else(|| {
            TablekitError::InvalidIdentifier(format!("unknown filter field {}", filter.field))
        })?;
        conditions.push(format!("{} {} ?", expr, filter.op));
        values.push(filter.value.clone());
    }
    if !conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }

    if let Some(fragment) = &request.subquery {
        sql = format!("SELECT * FROM ({}) AS subquery {}", sql, fragment.trim())
            .trim_end()
            .to_string();
    }

    if let Some(order) = &request.order_by {
        let expr = if request.subquery.is_some() {
            // the outer query only sees unqualified result columns
            let column = order.column.rsplit('.').next().unwrap_or_default();
            resolver.reference(column)?.map(|_| quote_ident(column))
        } else {
            resolver.reference(&order.column)?
        };
        let expr = expr.ok_or_else(|| TablekitError::InvalidIdentifier(order.column.clone()))?;
        sql.push_str(&format!(
            " ORDER BY {}{}",
            expr,
            if order.descending { " DESC" } else { "" }
        ));
    }

    if let Some(limit) = request.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    Ok(Statement { sql, values })
}
