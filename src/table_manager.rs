//! Generic CRUD and multi-table select over described tables.
//!
//! Each operation runs validate, describe, filter, build, bind, execute and
//! maps the outcome into an [`Envelope`]. Malformed identifiers and
//! operators are returned as `Err`; every other failure becomes an `err`
//! envelope.
use crate::builder::{
    build_delete, build_insert, build_select, build_select_all, build_update, OrderBy,
    QueryRequest, Statement, TableColumns,
};
use crate::context::EngineContext;
use crate::core::db::{list_tables, PooledConnection, QueryResult, TransactionState};
use crate::core::{Record, Result, TablekitError, Value};
use crate::envelope::{DebugTrace, Envelope, ErrorInfo, Resp};
use crate::schema_cache::{validate_identifier, SchemaRef};
use crate::validator::Operation;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn new_trace(operation: &str, tables: &[&str]) -> DebugTrace {
    DebugTrace {
        operation: operation.to_string(),
        sql: String::new(),
        values: Vec::new(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
    }
}

fn record_statement(trace: &mut DebugTrace, stmt: &Statement) {
    trace.sql = stmt.sql.clone();
    trace.values = stmt.values.clone();
}

/// Entry point for table operations. Each call checks out its own pooled
/// handle; use [`TableManager::session`] to run several calls on one handle.
#[derive(Debug, Clone)]
pub struct TableManager {
    ctx: Arc<EngineContext>,
}

impl TableManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        TableManager { ctx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Checks out a handle for several operations.
    ///
    /// # Errors
    ///
    /// `TablekitError::PoolExhausted` when every handle is in use.
    pub fn session(&self) -> Result<Session> {
        let conn = self.ctx.pool().get(&self.ctx.config().database.charset)?;
        Ok(Session {
            ctx: Arc::clone(&self.ctx),
            conn,
        })
    }

    /// Runs `op` on a fresh session; checkout failures become `err`
    /// envelopes after the table names passed the identifier check.
    fn with_session<F>(&self, tables: &[&str], op: F) -> Result<Envelope>
    where
        F: FnOnce(&mut Session) -> Result<Envelope>,
    {
        for table in tables {
            validate_identifier(table)?;
        }
        let started = Instant::now();
        match self.session() {
            Ok(mut session) => op(&mut session),
            Err(e) => {
                warn!(error = %e, "no connection available");
                Ok(Envelope::from_error(&e, self.ctx.debug_mode(), started))
            }
        }
    }

    pub fn insert(&self, table: &str, data: &Record) -> Result<Envelope> {
        self.with_session(&[table], |s| s.insert(table, data))
    }

    pub fn update(&self, table: &str, data: &Record, where_: &Record) -> Result<Envelope> {
        self.with_session(&[table], |s| s.update(table, data, where_))
    }

    pub fn delete(&self, table: &str, where_: &Record) -> Result<Envelope> {
        self.with_session(&[table], |s| s.delete(table, where_))
    }

    pub fn select(
        &self,
        table: &str,
        data: &Record,
        limit: Option<u64>,
        order_by: Option<&OrderBy>,
    ) -> Result<Envelope> {
        self.with_session(&[table], |s| s.select(table, data, limit, order_by))
    }

    pub fn select_all_tables(&self, request: &QueryRequest) -> Result<Envelope> {
        let tables: Vec<&str> = request.tables.iter().map(String::as_str).collect();
        self.with_session(&tables, |s| s.select_all_tables(request))
    }

    /// Column metadata of `table`, through the schema cache.
    pub fn describe_table(&self, table: &str, force: bool) -> Result<SchemaRef> {
        validate_identifier(table)?;
        self.session()?.describe(table, force)
    }

    /// Names of the tables in the database.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.session()?.list_tables()
    }

    /// Drops cached descriptions of `table`, or of every table.
    pub fn clear_cache(&self, table: Option<&str>) -> Result<()> {
        self.ctx.schema_cache().clear(table)
    }
}

/// One pooled handle plus the engine context. Dropping a session with an
/// open transaction rolls it back.
#[derive(Debug)]
pub struct Session {
    ctx: Arc<EngineContext>,
    conn: PooledConnection,
}

impl Session {
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.conn.begin_transaction()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.conn.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.conn.rollback()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.conn.transaction_state()
    }

    /// Runs caller SQL with bound values.
    pub fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.conn.execute(sql, params)
    }

    pub fn query_raw(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.conn.query(sql, params)
    }

    pub fn describe(&self, table: &str, force: bool) -> Result<SchemaRef> {
        self.ctx.schema_cache().describe(&*self.conn, table, force)
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        list_tables(&self.conn)
    }

    fn check_rules(&self, table: &str, data: &Record, operation: Operation) -> Result<()> {
        self.ctx.validator().validate(table, data, operation).into_result()
    }

    /// Inserts the writable, known fields of `data`.
    ///
    /// `insert_data` carries the new id under `id<table>` and under the
    /// primary key name when that differs.
    pub fn insert(&mut self, table: &str, data: &Record) -> Result<Envelope> {
        let started = Instant::now();
        let mut trace = new_trace("insert", &[table]);
        let outcome = self.run_insert(table, data, &mut trace, started);
        self.finish(outcome, trace, started)
    }

    fn run_insert(
        &self,
        table: &str,
        data: &Record,
        trace: &mut DebugTrace,
        started: Instant,
    ) -> Result<Envelope> {
        validate_identifier(table)?;
        let data = data.normalized();
        self.check_rules(table, &data, Operation::Insert)?;
        let columns = self.describe(table, false)?;

        let stmt = build_insert(table, &columns, &data, &now())?;
        record_statement(trace, &stmt);
        let affected = self.conn.execute(&stmt.sql, &stmt.values)?;
        let id = if affected > 0 { self.conn.last_insert_id() } else { 0 };

        if id <= 0 {
            let mut envelope = Envelope::new(Resp::Err, started);
            envelope.error = Some(ErrorInfo {
                kind: "insert_failed".to_string(),
                message: format!("No row id returned for {}", table),
            });
            return Ok(envelope);
        }

        let mut insert_data = Record::new().with(format!("id{}", table), id);
        if let Some(pk) = columns.iter().find(|c| c.is_primary()) {
            insert_data.insert(pk.name.clone(), id);
        }
        debug!(table, id, "row inserted");

        let mut envelope = Envelope::new(Resp::Add, started).with_count(affected as u64);
        envelope.insert_data = Some(insert_data);
        Ok(envelope)
    }

    /// Updates rows matching the known fields of `where_`.
    pub fn update(&mut self, table: &str, data: &Record, where_: &Record) -> Result<Envelope> {
        let started = Instant::now();
        let mut trace = new_trace("update", &[table]);
        let outcome = self.run_update(table, data, where_, &mut trace, started);
        self.finish(outcome, trace, started)
    }

    fn run_update(
        &self,
        table: &str,
        data: &Record,
        where_: &Record,
        trace: &mut DebugTrace,
        started: Instant,
    ) -> Result<Envelope> {
        validate_identifier(table)?;
        let data = data.normalized();
        self.check_rules(table, &data, Operation::Update)?;
        let columns = self.describe(table, false)?;

        let stmt = build_update(table, &columns, &data, &where_.normalized(), &now())?;
        record_statement(trace, &stmt);
        let affected = self.conn.execute(&stmt.sql, &stmt.values)?;

        let resp = if affected > 0 { Resp::Edit } else { Resp::NoChange };
        Ok(Envelope::new(resp, started).with_count(affected as u64))
    }

    /// Deletes rows matched by the id-like known fields of `where_`.
    pub fn delete(&mut self, table: &str, where_: &Record) -> Result<Envelope> {
        let started = Instant::now();
        let mut trace = new_trace("delete", &[table]);
        let outcome = self.run_delete(table, where_, &mut trace, started);
        self.finish(outcome, trace, started)
    }

    fn run_delete(
        &self,
        table: &str,
        where_: &Record,
        trace: &mut DebugTrace,
        started: Instant,
    ) -> Result<Envelope> {
        validate_identifier(table)?;
        let where_ = where_.normalized();
        self.check_rules(table, &where_, Operation::Delete)?;
        let columns = self.describe(table, false)?;

        let (stmt, accepted) = build_delete(table, &columns, &where_)?;
        record_statement(trace, &stmt);
        let affected = self.conn.execute(&stmt.sql, &stmt.values)?;

        let resp = if affected > 0 { Resp::Dele } else { Resp::NoRegistro };
        let mut envelope = Envelope::new(resp, started).with_count(affected as u64);
        envelope.delete_data = Some(accepted);
        Ok(envelope)
    }

    /// Single-table select filtered by the known fields of `data`.
    pub fn select(
        &mut self,
        table: &str,
        data: &Record,
        limit: Option<u64>,
        order_by: Option<&OrderBy>,
    ) -> Result<Envelope> {
        let started = Instant::now();
        let mut trace = new_trace("select", &[table]);
        let outcome = self.run_select(table, data, limit, order_by, &mut trace, started);
        self.finish(outcome, trace, started)
    }

    fn run_select(
        &self,
        table: &str,
        data: &Record,
        limit: Option<u64>,
        order_by: Option<&OrderBy>,
        trace: &mut DebugTrace,
        started: Instant,
    ) -> Result<Envelope> {
        validate_identifier(table)?;
        let columns = self.describe(table, false)?;
        let stmt = build_select(table, &columns, &data.normalized(), order_by, limit)?;
        record_statement(trace, &stmt);
        Ok(rows_envelope(self.conn.query(&stmt.sql, &stmt.values)?, started))
    }

    /// Natural-join select across `request.tables`, plus any tables named
    /// in the custom join fragment.
    pub fn select_all_tables(&mut self, request: &QueryRequest) -> Result<Envelope> {
        let started = Instant::now();
        let tables: Vec<&str> = request.tables.iter().map(String::as_str).collect();
        let mut trace = new_trace("select_all_tables", &tables);
        let outcome = self.run_select_all(request, &mut trace, started);
        self.finish(outcome, trace, started)
    }

    fn run_select_all(
        &self,
        request: &QueryRequest,
        trace: &mut DebugTrace,
        started: Instant,
    ) -> Result<Envelope> {
        for table in &request.tables {
            validate_identifier(table)?;
        }
        let mut request = request.clone();
        request.data = request.data.normalized();

        let join_names = request.join_tables();
        trace.tables.extend(join_names.iter().cloned());

        let base_schemas = request
            .tables
            .iter()
            .map(|t| self.describe(t, false))
            .collect::<Result<Vec<_>>>()?;
        let joined_schemas = join_names
            .iter()
            .map(|t| self.describe(t, false))
            .collect::<Result<Vec<_>>>()?;

        let base: Vec<TableColumns<'_>> = request
            .tables
            .iter()
            .zip(&base_schemas)
            .map(|(name, columns)| TableColumns::new(name, columns.as_slice()))
            .collect();
        let joined: Vec<TableColumns<'_>> = join_names
            .iter()
            .zip(&joined_schemas)
            .map(|(name, columns)| TableColumns::new(name, columns.as_slice()))
            .collect();

        let stmt = build_select_all(&request, &base, &joined)?;
        record_statement(trace, &stmt);
        Ok(rows_envelope(self.conn.query(&stmt.sql, &stmt.values)?, started))
    }

    /// Propagates identifier and operator errors, turns the rest into `err`
    /// envelopes and stamps timing plus the debug trace.
    fn finish(&self, outcome: Result<Envelope>, trace: DebugTrace, started: Instant) -> Result<Envelope> {
        let debug_mode = self.ctx.debug_mode();
        let mut envelope = match outcome {
            Ok(envelope) => envelope,
            Err(e) if e.is_fatal() => {
                warn!(operation = trace.operation.as_str(), error = %e, "rejected request");
                return Err(e);
            }
            Err(e) => {
                match &e {
                    TablekitError::Database(_) => {
                        error!(operation = trace.operation.as_str(), sql = trace.sql.as_str(), error = %e, "statement failed")
                    }
                    _ => debug!(operation = trace.operation.as_str(), error = %e, "operation refused"),
                }
                Envelope::from_error(&e, debug_mode, started)
            }
        };
        envelope.time_second = started.elapsed().as_secs_f64();
        if debug_mode {
            envelope.debug = Some(trace);
        }
        Ok(envelope)
    }
}

fn rows_envelope(result: QueryResult, started: Instant) -> Envelope {
    let resp = if result.rows.is_empty() { Resp::NoData } else { Resp::Select };
    Envelope::new(resp, started).with_rows(result.rows)
}
