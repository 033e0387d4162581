//! One open connection to the SQL engine.
//!
//! A handle owns its connection, a prepared-statement cache, the stack of
//! nested transactions (savepoints), and the set of configuration entries it
//! has applied. Handles are created lazily by the pool and only ever used by
//! the thread holding their lease.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::types::Value;
use rusqlite::Connection;
use rustc_hash::FxHashSet;

use godwit_result::{Code, Error, Result};
use godwit_sql::ast::Statement;

use crate::cipher::CipherConfig;
use crate::config::ConfigEntry;
use crate::trace::TraceSnapshot;
use crate::tracker;

/// Backoff schedule for transient lock contention, on top of the engine's
/// own busy timeout. Totals roughly a quarter second.
const RETRY_DELAYS_MS: [u64; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// WAL checkpoint variants exposed by the facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Truncate,
}

impl CheckpointMode {
    fn sql(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

pub struct Handle {
    pub(crate) conn: Connection,
    path: PathBuf,
    id: u64,
    database_id: u64,
    tag: Arc<AtomicI64>,
    pub(crate) applied: Vec<Arc<ConfigEntry>>,
    pub(crate) applied_generation: u64,
    pub(crate) epoch: u64,
    savepoint_depth: usize,
    attached: FxHashSet<String>,
    fatal: Option<Code>,
    wrote: bool,
    traces: TraceSnapshot,
}

impl Handle {
    pub(crate) fn open(
        path: &Path,
        id: u64,
        database_id: u64,
        tag: Arc<AtomicI64>,
        epoch: u64,
        traces: TraceSnapshot,
    ) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| {
            Error::from(err)
                .with_path(path)
                .with_tag(tag.load(Ordering::Relaxed))
        })?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            id,
            database_id,
            tag,
            applied: Vec::new(),
            applied_generation: 0,
            epoch,
            savepoint_depth: 0,
            attached: FxHashSet::default(),
            fatal: None,
            wrote: false,
            traces,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn traces(&self) -> &TraceSnapshot {
        &self.traces
    }

    pub(crate) fn fatal_code(&self) -> Option<Code> {
        self.fatal
    }

    /// True when a write statement succeeded since the last call.
    pub(crate) fn take_wrote(&mut self) -> bool {
        std::mem::take(&mut self.wrote)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Attach a context to an engine error, remember it for `last_error`,
    /// and mark the handle when the code is fatal.
    fn note(&mut self, error: Error, sql: Option<&str>) -> Error {
        let mut error = error
            .with_path(&self.path)
            .with_tag(self.tag.load(Ordering::Relaxed));
        if let Some(sql) = sql {
            error = error.with_sql(sql);
        }
        // Corruption and I/O failures poison the handle: it is discarded on
        // checkin instead of returning to the idle set.
        if error.is_fatal_corruption() || error.code == Code::Io {
            self.fatal = Some(error.code);
        }
        tracker::record(self.database_id, &error);
        self.traces.on_error(&error);
        error
    }

    /// Execute a statement value. Rendering happens once, here; the tree is
    /// the source of truth everywhere above this point.
    pub fn execute_statement(&mut self, statement: &Statement, params: &[Value]) -> Result<usize> {
        let sql = statement.to_string();
        self.execute(&sql, params)
    }

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        self.trace_sql(sql, params);
        let started = Instant::now();
        let result = self.with_retry(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let needed = stmt.parameter_count();
            if needed > params.len() {
                return Err(Error::misuse(format!(
                    "statement needs {needed} parameters, {} given",
                    params.len()
                )));
            }
            for (index, value) in params.iter().take(needed).enumerate() {
                stmt.raw_bind_parameter(index + 1, value)?;
            }
            Ok(stmt.raw_execute()?)
        });
        self.traces.on_performance(sql, started.elapsed());
        match result {
            Ok(changes) => {
                if statement_writes(sql) {
                    self.wrote = true;
                }
                Ok(changes)
            }
            Err(err) => Err(self.note(err, Some(sql))),
        }
    }

    pub fn query_rows_statement(
        &mut self,
        statement: &Statement,
        params: &[Value],
    ) -> Result<Vec<Vec<Value>>> {
        let sql = statement.to_string();
        self.query_rows(&sql, params)
    }

    pub fn query_rows(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        self.trace_sql(sql, params);
        let started = Instant::now();
        let result = self.with_retry(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let needed = stmt.parameter_count();
            if needed > params.len() {
                return Err(Error::misuse(format!(
                    "statement needs {needed} parameters, {} given",
                    params.len()
                )));
            }
            for (index, value) in params.iter().take(needed).enumerate() {
                stmt.raw_bind_parameter(index + 1, value)?;
            }
            let column_count = stmt.column_count();
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(column_count);
                for index in 0..column_count {
                    values.push(row.get::<_, Value>(index)?);
                }
                out.push(values);
            }
            Ok(out)
        });
        self.traces.on_performance(sql, started.elapsed());
        result.map_err(|err| self.note(err, Some(sql)))
    }

    /// Run `operation`, retrying transient lock contention with backoff.
    fn with_retry<T>(
        &self,
        _sql: &str,
        operation: impl Fn(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut delays = RETRY_DELAYS_MS.iter();
        loop {
            match operation(&self.conn) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => match delays.next() {
                    Some(ms) => std::thread::sleep(Duration::from_millis(*ms)),
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    fn trace_sql(&self, sql: &str, params: &[Value]) {
        if self.traces.full_sql() && !params.is_empty() {
            self.traces.on_sql(&format!("{sql} -- bound: {params:?}"));
        } else {
            self.traces.on_sql(sql);
        }
    }

    // ------------------------------------------------------------------
    // Nested transactions
    // ------------------------------------------------------------------

    /// Open a nested transaction (savepoint). Every `begin_nested` is
    /// balanced by exactly one `commit_nested` or `rollback_nested`.
    pub fn begin_nested(&mut self) -> Result<()> {
        let name = format!("godwit_{}", self.savepoint_depth);
        self.conn
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(|err| self.note(Error::from(err), None))?;
        self.savepoint_depth += 1;
        Ok(())
    }

    pub fn commit_nested(&mut self) -> Result<()> {
        if self.savepoint_depth == 0 {
            return Err(Error::internal("commit_nested without begin_nested"));
        }
        let name = format!("godwit_{}", self.savepoint_depth - 1);
        self.conn
            .execute_batch(&format!("RELEASE {name}"))
            .map_err(|err| self.note(Error::from(err), None))?;
        self.savepoint_depth -= 1;
        Ok(())
    }

    pub fn rollback_nested(&mut self) -> Result<()> {
        if self.savepoint_depth == 0 {
            return Err(Error::internal("rollback_nested without begin_nested"));
        }
        let name = format!("godwit_{}", self.savepoint_depth - 1);
        let result = self
            .conn
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
            .map_err(|err| self.note(Error::from(err), None));
        // The savepoint is gone either way; a failed rollback poisons the
        // handle so the pool discards it.
        self.savepoint_depth -= 1;
        if let Err(err) = &result {
            if self.fatal.is_none() {
                self.fatal = Some(err.code);
            }
        }
        result
    }

    pub(crate) fn savepoint_depth(&self) -> usize {
        self.savepoint_depth
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn wal_checkpoint(&mut self, mode: CheckpointMode) -> Result<()> {
        self.conn
            .query_row(mode.sql(), [], |_| Ok(()))
            .map_err(|err| self.note(Error::from(err), Some(mode.sql())))
    }

    /// Run a quick integrity probe; `Ok(true)` means the image looks sound.
    pub fn integrity_ok(&mut self) -> Result<bool> {
        let verdict: String = self
            .conn
            .query_row("PRAGMA integrity_check(1)", [], |row| row.get(0))
            .map_err(|err| self.note(Error::from(err), None))?;
        Ok(verdict.eq_ignore_ascii_case("ok"))
    }

    pub fn is_attached(&self, schema: &str) -> bool {
        self.attached.contains(schema)
    }

    /// Attach another database under `schema`, applying its cipher first
    /// when one is configured.
    pub fn attach(
        &mut self,
        path: &Path,
        schema: &str,
        cipher: Option<&CipherConfig>,
    ) -> Result<()> {
        if self.attached.contains(schema) {
            return Ok(());
        }
        let sql = format!(
            "ATTACH DATABASE ? AS {}",
            godwit_sql::parse::quote_identifier(schema)
        );
        let path_text = path.to_string_lossy().into_owned();
        self.conn
            .execute(&sql, [&path_text])
            .map_err(|err| self.note(Error::from(err), Some(&sql)))?;
        if let Some(cipher) = cipher {
            self.conn
                .execute_batch(&cipher.pragma_sql(Some(schema)))
                .map_err(|err| self.note(Error::from(err), None))?;
        }
        self.attached.insert(schema.to_string());
        Ok(())
    }

    pub fn detach(&mut self, schema: &str) -> Result<()> {
        if !self.attached.contains(schema) {
            return Ok(());
        }
        let sql = format!(
            "DETACH DATABASE {}",
            godwit_sql::parse::quote_identifier(schema)
        );
        self.conn
            .execute_batch(&sql)
            .map_err(|err| self.note(Error::from(err), Some(&sql)))?;
        self.attached.remove(schema);
        Ok(())
    }
}

/// Whether the first keyword of `sql` mutates the database. Drives the
/// auto-backup throttle; a false negative only delays a backup.
fn statement_writes(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "CREATE" | "DROP" | "ALTER"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_handle(dir: &tempfile::TempDir) -> Handle {
        Handle::open(
            &dir.path().join("h.db"),
            1,
            1,
            Arc::new(AtomicI64::new(0)),
            0,
            TraceSnapshot::default(),
        )
        .unwrap()
    }

    #[test]
    fn execute_and_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = open_handle(&dir);
        handle
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .unwrap();
        let inserted = handle
            .execute(
                "INSERT INTO t (id, v) VALUES (?, ?)",
                &[Value::Integer(1), Value::Text("a".to_string())],
            )
            .unwrap();
        assert_eq!(inserted, 1);
        assert!(handle.take_wrote());

        let rows = handle.query_rows("SELECT id, v FROM t", &[]).unwrap();
        assert_eq!(
            rows,
            vec![vec![Value::Integer(1), Value::Text("a".to_string())]]
        );
        assert!(!handle.take_wrote());
    }

    #[test]
    fn extra_parameters_are_ignored_missing_ones_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = open_handle(&dir);
        handle.execute("CREATE TABLE t (v TEXT)", &[]).unwrap();
        // Mirrored shadows bind a prefix of the primary's parameters, so
        // surplus values are fine.
        handle
            .execute(
                "INSERT INTO t (v) VALUES (?)",
                &[Value::Text("a".to_string()), Value::Integer(9)],
            )
            .unwrap();
        let err = handle.execute("INSERT INTO t (v) VALUES (?)", &[]).unwrap_err();
        assert_eq!(err.code, Code::Misuse);
    }

    #[test]
    fn savepoints_balance_and_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = open_handle(&dir);
        handle.execute("CREATE TABLE t (v INTEGER)", &[]).unwrap();

        handle.begin_nested().unwrap();
        handle
            .execute("INSERT INTO t (v) VALUES (?)", &[Value::Integer(1)])
            .unwrap();
        handle.begin_nested().unwrap();
        handle
            .execute("INSERT INTO t (v) VALUES (?)", &[Value::Integer(2)])
            .unwrap();
        handle.rollback_nested().unwrap();
        handle.commit_nested().unwrap();
        assert_eq!(handle.savepoint_depth(), 0);

        let rows = handle.query_rows("SELECT v FROM t", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(1)]]);
    }

    #[test]
    fn errors_carry_path_and_sql_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = open_handle(&dir);
        let err = handle.execute("INSERT INTO missing VALUES (1)", &[]).unwrap_err();
        assert!(err.path.is_some());
        assert!(err.sql.as_deref().unwrap().contains("missing"));
    }

    #[test]
    fn attach_and_detach_track_schemas() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("other.db");
        rusqlite::Connection::open(&other)
            .unwrap()
            .execute_batch("CREATE TABLE src (x INTEGER); INSERT INTO src VALUES (7);")
            .unwrap();

        let mut handle = open_handle(&dir);
        handle.attach(&other, "legacy", None).unwrap();
        assert!(handle.is_attached("legacy"));
        // Idempotent.
        handle.attach(&other, "legacy", None).unwrap();

        let rows = handle.query_rows("SELECT x FROM legacy.src", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(7)]]);

        handle.detach("legacy").unwrap();
        assert!(!handle.is_attached("legacy"));
    }

    #[test]
    fn integrity_probe_reports_ok_for_a_sound_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = open_handle(&dir);
        handle.execute("CREATE TABLE t (v TEXT)", &[]).unwrap();
        assert!(handle.integrity_ok().unwrap());
    }
}
