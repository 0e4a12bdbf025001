use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use persist_core::{
    Backend, Cursor, Driver, FixedRetry, PersistError, QueryParams, RawRow, Result, RetryPolicy,
    Rule,
};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use crate::predicate::{build_query_sql, json_path_expr, quote_ident};
use crate::statement_cache::StatementCache;

/// Environment variable selecting statement/row tracing to stderr.
pub const LOGGING_ENV: &str = "LIBPERSIST_LOGGING";

/// Serializes write steps and transaction boundaries across every backend in
/// the process. The shared-cache engine allows a single writer anyway;
/// taking the mutex before stepping keeps a BEGIN from interleaving with an
/// in-flight write step. It is held per step attempt, never across a whole
/// transaction or a retry sleep.
static WRITE_SERIALIZER: Mutex<()> = Mutex::new(());

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Reference driver mapping the document model onto SQLite with its JSON
/// functions. Registered under the name `"sqlite"`.
pub struct SqliteDriver {
    retry: Arc<dyn RetryPolicy>,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            retry: Arc::new(FixedRetry::default()),
        }
    }

    /// Backends opened by this driver will use `policy` for busy/locked
    /// backoff instead of the default indefinite 1 ms retry.
    pub fn with_retry_policy(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { retry: policy }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn open(&self, path: &Path, _params: Option<&Value>) -> Result<Box<dyn Backend>> {
        let flags = OpenFlags::default() | OpenFlags::SQLITE_OPEN_SHARED_CACHE;

        let mut conn =
            Connection::open_with_flags(path, flags).map_err(|e| internal_error(&e))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| internal_error(&e))?;
        conn.pragma_update(None, "synchronous", "OFF")
            .map_err(|e| internal_error(&e))?;
        conn.set_prepared_statement_cache_capacity(128);

        register_regexp(&conn)?;

        let trace_rows = std::env::var(LOGGING_ENV).as_deref() == Ok("stderr");
        if trace_rows {
            conn.trace(Some(trace_statement));
        }

        log::info!("sqlite backend opened at {}", path.display());

        Ok(Box::new(SqliteBackend {
            conn: Mutex::new(conn),
            statements: StatementCache::new(),
            retry: self.retry.clone(),
            trace_rows,
        }))
    }
}

fn trace_statement(sql: &str) {
    eprintln!("persist sqlite: executing {sql}");
}

/// The `~` rule operator lowers to REGEXP, which SQLite leaves to the
/// application. The compiled pattern is cached per statement as auxiliary
/// data.
fn register_regexp(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;

            let text = ctx
                .get_raw(1)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;

            Ok(pattern.is_match(text))
        },
    )
    .map_err(|e| internal_error(&e))
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    statements: StatementCache,
    retry: Arc<dyn RetryPolicy>,
    trace_rows: bool,
}

impl SqliteBackend {
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PersistError::internal(format!("connection lock poisoned: {e}")))
    }

    /// Runs `op`, sleeping and retrying per the configured policy while the
    /// engine reports busy/locked. Exhausting the policy surfaces an
    /// internal error; any other failure surfaces immediately.
    fn with_retry<T>(&self, mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
        let mut attempt = 0u32;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) => {
                    attempt += 1;
                    match self.retry.backoff(attempt) {
                        Some(delay) => std::thread::sleep(delay),
                        None => {
                            return Err(PersistError::internal(format!(
                                "database busy after {attempt} attempts: {err}"
                            )));
                        }
                    }
                }
                Err(err) => return Err(internal_error(&err)),
            }
        }
    }

    /// Write-path variant: each attempt steps under the process-wide write
    /// mutex, released before any retry sleep.
    fn with_write_retry<T>(&self, mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
        self.with_retry(|| {
            let _write = WRITE_SERIALIZER.lock().unwrap_or_else(|e| e.into_inner());
            op()
        })
    }

    fn unpack(&self, collection: &str, id: &str, payload: &str) -> Result<Value> {
        if self.trace_rows {
            eprintln!("persist sqlite: table {collection}: returning row {id}");
        }

        let value: Value = serde_json::from_str(payload)?;
        if !value.is_object() {
            return Err(PersistError::internal(format!(
                "inconsistent database state: payload of {collection}[{id}] is not a mapping"
            )));
        }

        Ok(value)
    }
}

impl Backend for SqliteBackend {
    fn close(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        self.statements.clear(&conn);
        Ok(())
    }

    fn create_collection(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, value TEXT)",
            quote_ident(name)
        );

        let conn = self.lock_conn()?;
        self.with_write_retry(|| conn.execute(&sql, []))?;
        Ok(())
    }

    fn destroy_collection(&self, name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(name));

        let conn = self.lock_conn()?;
        self.with_write_retry(|| conn.execute(&sql, []))?;
        self.statements.evict(&conn, name);
        Ok(())
    }

    fn collections(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;

        self.with_retry(|| {
            let mut stmt = conn.prepare_cached(
                "SELECT name FROM sqlite_master \
                 WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }

    fn add_index(&self, collection: &str, index_name: &str, path: &str) -> Result<()> {
        let sql = format!(
            "CREATE INDEX {} ON {} ({})",
            quote_ident(&format!("{collection}_{index_name}")),
            quote_ident(collection),
            json_path_expr(path)
        );

        log::debug!("[INDEX] {sql}");

        let conn = self.lock_conn()?;
        self.with_write_retry(|| conn.execute(&sql, []))?;
        Ok(())
    }

    fn drop_index(&self, collection: &str, index_name: &str) -> Result<()> {
        let sql = format!(
            "DROP INDEX {}",
            quote_ident(&format!("{collection}_{index_name}"))
        );

        let conn = self.lock_conn()?;
        self.with_write_retry(|| conn.execute(&sql, []))?;
        Ok(())
    }

    fn get_object(&self, collection: &str, id: &str) -> Result<Value> {
        let conn = self.lock_conn()?;
        let statements = self.statements.get_or_prepare(&conn, collection)?;

        let row: Option<(String, String)> = self.with_retry(|| {
            let mut stmt = conn.prepare_cached(&statements.get)?;
            stmt.query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()
        })?;

        match row {
            Some((row_id, payload)) => self.unpack(collection, &row_id, &payload),
            None => Err(PersistError::not_found(format!(
                "{collection}[{id}] not found"
            ))),
        }
    }

    fn save_object(&self, collection: &str, id: &str, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value)?;

        let conn = self.lock_conn()?;
        let statements = self.statements.get_or_prepare(&conn, collection)?;

        log::debug!("[SAVE] {collection}[{id}]");

        self.with_write_retry(|| {
            let mut stmt = conn.prepare_cached(&statements.upsert)?;
            stmt.execute(params![id, payload])
        })?;

        Ok(())
    }

    fn delete_object(&self, collection: &str, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let statements = self.statements.get_or_prepare(&conn, collection)?;

        log::debug!("[DELETE] {collection}[{id}]");

        // Zero affected rows means the key was already absent, which is
        // still success.
        self.with_write_retry(|| {
            let mut stmt = conn.prepare_cached(&statements.delete)?;
            stmt.execute(params![id])
        })?;

        Ok(())
    }

    fn begin_transaction(&self) -> Result<()> {
        log::debug!("[TX] begin");
        let conn = self.lock_conn()?;
        self.with_write_retry(|| conn.execute_batch("BEGIN"))
    }

    fn commit_transaction(&self) -> Result<()> {
        log::debug!("[TX] commit");
        let conn = self.lock_conn()?;
        self.with_write_retry(|| conn.execute_batch("COMMIT"))
    }

    fn rollback_transaction(&self) -> Result<()> {
        log::debug!("[TX] rollback");
        let conn = self.lock_conn()?;
        self.with_write_retry(|| conn.execute_batch("ROLLBACK"))
    }

    fn in_transaction(&self) -> Result<bool> {
        Ok(!self.lock_conn()?.is_autocommit())
    }

    fn count(&self, collection: &str, rules: &[Rule]) -> Result<u64> {
        let compiled = build_query_sql(collection, rules, &QueryParams::new().counting())?;

        log::debug!("[COUNT] {}", compiled.sql);

        let conn = self.lock_conn()?;
        let count: i64 = self.with_retry(|| {
            let mut stmt = conn.prepare(&compiled.sql)?;
            stmt.query_row(params_from_iter(compiled.params.iter()), |row| row.get(0))
        })?;

        Ok(count.max(0) as u64)
    }

    fn query(
        &self,
        collection: &str,
        rules: &[Rule],
        params: &QueryParams,
    ) -> Result<Box<dyn Cursor>> {
        let compiled = build_query_sql(collection, rules, params)?;

        log::debug!("[QUERY] {}", compiled.sql);

        // The result set is drained up front: a live statement borrows the
        // connection, and handing it across the facade would pin the
        // connection lock for the cursor's whole lifetime.
        let conn = self.lock_conn()?;
        let counting = params.count;

        let fetched: Vec<(Option<String>, String)> = self.with_retry(|| {
            let mut stmt = conn.prepare(&compiled.sql)?;
            let mut rows = stmt.query(params_from_iter(compiled.params.iter()))?;
            let mut out = Vec::new();

            while let Some(row) = rows.next()? {
                if counting {
                    out.push((None, row.get::<_, i64>(0)?.to_string()));
                } else {
                    out.push((Some(row.get::<_, String>(0)?), row.get::<_, String>(1)?));
                }
            }

            Ok(out)
        })?;

        let mut rows = VecDeque::with_capacity(fetched.len());
        for (id, payload) in fetched {
            match id {
                Some(id) => {
                    let value = self.unpack(collection, &id, &payload)?;
                    rows.push_back(RawRow {
                        id: Some(id),
                        value,
                    });
                }
                None => {
                    let count: i64 = payload.parse().map_err(|_| {
                        PersistError::internal(format!("bad count projection: {payload}"))
                    })?;
                    rows.push_back(RawRow {
                        id: None,
                        value: Value::from(count),
                    });
                }
            }
        }

        Ok(Box::new(SqliteCursor { rows }))
    }
}

/// Cursor over an already-drained result set; single forward pass.
struct SqliteCursor {
    rows: VecDeque<RawRow>,
}

impl Cursor for SqliteCursor {
    fn next_row(&mut self) -> Result<Option<RawRow>> {
        Ok(self.rows.pop_front())
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    )
}

fn internal_error(err: &rusqlite::Error) -> PersistError {
    log::error!("sqlite operation failed: {err}");
    PersistError::internal(err.to_string())
}
