//! The migration registry: resolved per-table state behind a readers-writer
//! lock, plus the persisted progress marker.
//!
//! Tables are resolved lazily: the first statement (or stepper pass) that
//! names a table runs it through the user's filter callback once, loads the
//! declared column order, and caches the outcome. The only on-disk state the
//! engine owns is the `wcdb_builtin_kv` table with keys `migration` (current
//! target) and `completed` (JSON list); it survives crashes and seeds the
//! in-memory state on first use.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rusqlite::types::Value;
use rustc_hash::{FxHashMap, FxHashSet};

use godwit_result::Result;
use godwit_sql::{parse_expr, TableMigration, TamperContext};

use crate::cipher::CipherConfig;
use crate::handle::Handle;
use crate::migration::{MigratedInfo, MigrationSource};

/// Schema name the source database is attached under.
pub(crate) const SOURCE_SCHEMA: &str = "godwit_source";

const KV_TABLE: &str = "wcdb_builtin_kv";
const KEY_MIGRATION: &str = "migration";
const KEY_COMPLETED: &str = "completed";

pub(crate) type TableFilterFn = Arc<dyn Fn(&str) -> Option<MigrationSource> + Send + Sync>;
pub(crate) type MigratedNotification = Arc<dyn Fn(Option<&MigratedInfo>) + Send + Sync>;

enum Resolution {
    Migrating(Arc<TableMigration>),
    Excluded,
}

#[derive(Default)]
struct RegistryState {
    filter: Option<TableFilterFn>,
    source_path: Option<PathBuf>,
    source_cipher: Option<CipherConfig>,
    resolved: FxHashMap<String, Resolution>,
    /// Migrating targets in resolution order; the stepper drains them in
    /// this order.
    order: Vec<String>,
    current: Option<String>,
    completed: FxHashSet<String>,
    started: bool,
    bootstrapped: bool,
    done_notified: bool,
    batch_size: usize,
}

pub(crate) struct MigrationRegistry {
    state: RwLock<RegistryState>,
    configured: AtomicBool,
    all_done: AtomicBool,
    notification: Mutex<Option<MigratedNotification>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                batch_size: 10,
                ..RegistryState::default()
            }),
            configured: AtomicBool::new(false),
            all_done: AtomicBool::new(false),
            notification: Mutex::new(None),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn configure(
        &self,
        source_path: Option<PathBuf>,
        source_cipher: Option<CipherConfig>,
        filter: TableFilterFn,
    ) {
        let mut state = self.write_state();
        state.filter = Some(filter);
        state.source_path = source_path;
        state.source_cipher = source_cipher;
        state.done_notified = false;
        self.all_done.store(false, Ordering::Release);
        self.configured.store(true, Ordering::Release);
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Fast path consulted on every statement: when set, no table still has
    /// rows in a source and statements are forwarded untouched.
    pub fn all_completed(&self) -> bool {
        self.all_done.load(Ordering::Acquire)
    }

    pub fn is_migrated(&self) -> bool {
        !self.is_configured() || self.all_completed()
    }

    pub fn set_notification(&self, callback: Option<MigratedNotification>) {
        *self
            .notification
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }

    pub fn notify(&self, info: Option<&MigratedInfo>) {
        let callback = self
            .notification
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(info);
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap and resolution
    // ------------------------------------------------------------------

    /// Seed in-memory state from the persisted marker, once per process.
    /// Double-checked: the read-lock fast path wins after the first call.
    pub fn ensure_bootstrapped(&self, handle: &mut Handle) -> Result<()> {
        if self.read_state().bootstrapped {
            return Ok(());
        }
        let mut state = self.write_state();
        if state.bootstrapped {
            return Ok(());
        }
        if kv_table_exists(handle)? {
            if let Some(current) = kv_get(handle, KEY_MIGRATION)? {
                if !current.is_empty() {
                    state.current = Some(current);
                    state.started = true;
                }
            }
            if let Some(completed) = kv_get(handle, KEY_COMPLETED)? {
                if let Ok(tables) = serde_json::from_str::<Vec<String>>(&completed) {
                    if !tables.is_empty() {
                        state.started = true;
                    }
                    state.completed = tables.into_iter().collect();
                }
            }
        }
        if state.started {
            tracing::debug!(current = ?state.current, "resuming persisted migration state");
        }
        state.bootstrapped = true;
        Ok(())
    }

    /// Run every not-yet-seen table through the filter callback and cache
    /// the outcome, loading column metadata for tables that migrate.
    pub fn resolve_tables(&self, handle: &mut Handle, names: &[String]) -> Result<()> {
        {
            let state = self.read_state();
            if names.iter().all(|name| state.resolved.contains_key(name)) {
                return Ok(());
            }
        }
        let mut state = self.write_state();
        for name in names {
            if state.resolved.contains_key(name) {
                continue;
            }
            let resolution = self.resolve_one(&mut state, handle, name)?;
            if matches!(resolution, Resolution::Migrating(_)) {
                state.order.push(name.clone());
            }
            state.resolved.insert(name.clone(), resolution);
        }
        Ok(())
    }

    fn resolve_one(
        &self,
        state: &mut RegistryState,
        handle: &mut Handle,
        name: &str,
    ) -> Result<Resolution> {
        if name == KV_TABLE || name.starts_with("sqlite_") || state.completed.contains(name) {
            return Ok(Resolution::Excluded);
        }
        let Some(filter) = state.filter.clone() else {
            return Ok(Resolution::Excluded);
        };
        let Some(source) = filter(name) else {
            return Ok(Resolution::Excluded);
        };
        let source_table = source.source_table.to_ascii_lowercase();
        if state.source_path.is_none() && source_table == name {
            return Ok(Resolution::Excluded);
        }

        if let Some(path) = &state.source_path {
            handle.attach(path, SOURCE_SCHEMA, state.source_cipher.as_ref())?;
        }
        let schema = state.source_path.as_ref().map(|_| SOURCE_SCHEMA.to_string());
        if !table_exists(handle, schema.as_deref(), &source_table)? {
            // Nothing left to drain; the source is already gone.
            return Ok(Resolution::Excluded);
        }

        // Declared column order comes from the target; a target created
        // lazily by the ORM may not exist yet, in which case the source
        // (structurally identical by precondition) stands in.
        let (mut columns, mut integer_primary_key) = table_columns(handle, None, name)?;
        if columns.is_empty() {
            (columns, integer_primary_key) =
                table_columns(handle, schema.as_deref(), &source_table)?;
        }
        if columns.is_empty() {
            return Ok(Resolution::Excluded);
        }

        let filter_expr = match &source.filter {
            Some(sql) => Some(parse_expr(sql)?),
            None => None,
        };
        Ok(Resolution::Migrating(Arc::new(TableMigration {
            target_table: name.to_string(),
            source_table,
            source_schema: schema,
            filter: filter_expr,
            columns,
            integer_primary_key,
        })))
    }

    /// Attach the source database on this handle when any of `names`
    /// resolved to a migration with an attached source.
    pub fn ensure_attached(&self, handle: &mut Handle, names: &[String]) -> Result<()> {
        let (path, cipher) = {
            let state = self.read_state();
            let needed = names.iter().any(|name| {
                matches!(
                    state.resolved.get(name),
                    Some(Resolution::Migrating(migration)) if migration.source_schema.is_some()
                )
            });
            if !needed {
                return Ok(());
            }
            (state.source_path.clone(), state.source_cipher.clone())
        };
        if let Some(path) = path {
            handle.attach(&path, SOURCE_SCHEMA, cipher.as_ref())?;
        }
        Ok(())
    }

    /// Take the shared lock in read mode and expose the tamperer snapshot.
    /// The guard is held across statement execution so the stepper cannot
    /// restructure the registry mid-statement.
    pub fn read(&self) -> RegistryReadGuard<'_> {
        RegistryReadGuard(self.read_state())
    }

    // ------------------------------------------------------------------
    // Stepper support
    // ------------------------------------------------------------------

    /// The table currently being drained, choosing and persisting the next
    /// uncompleted one when none is in flight. `None` means nothing is left.
    pub fn pick_current(&self, handle: &mut Handle) -> Result<Option<Arc<TableMigration>>> {
        {
            let state = self.read_state();
            if let Some(current) = &state.current {
                if let Some(Resolution::Migrating(migration)) = state.resolved.get(current) {
                    return Ok(Some(Arc::clone(migration)));
                }
            }
        }

        // Discover candidates: every table in the primary schema runs
        // through the filter once.
        let rows = handle.query_rows(
            "SELECT name FROM main.sqlite_master WHERE type = 'table'",
            &[],
        )?;
        let names: Vec<String> = rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Value::Text(name)) => Some(name.to_ascii_lowercase()),
                _ => None,
            })
            .collect();
        self.resolve_tables(handle, &names)?;

        let picked = {
            let mut state = self.write_state();
            // A marker persisted by an earlier process run wins; otherwise
            // take the next uncompleted target in resolution order.
            let resumed = state.current.clone().filter(|table| {
                !state.completed.contains(table)
                    && matches!(state.resolved.get(table), Some(Resolution::Migrating(_)))
            });
            let next = resumed.or_else(|| {
                state
                    .order
                    .iter()
                    .find(|table| {
                        !state.completed.contains(*table)
                            && matches!(state.resolved.get(*table), Some(Resolution::Migrating(_)))
                    })
                    .cloned()
            });
            match next {
                Some(table) => {
                    state.current = Some(table.clone());
                    match state.resolved.get(&table) {
                        Some(Resolution::Migrating(migration)) => Some(Arc::clone(migration)),
                        _ => None,
                    }
                }
                None => None,
            }
        };
        if let Some(migration) = &picked {
            kv_set(handle, KEY_MIGRATION, &migration.target_table)?;
        }
        Ok(picked)
    }

    /// Persist completion of `target` inside the stepper's transaction so
    /// the drop of the source and the marker commit atomically.
    pub fn persist_completion(&self, handle: &mut Handle, target: &str) -> Result<()> {
        let mut completed: Vec<String> = {
            let state = self.read_state();
            state.completed.iter().cloned().collect()
        };
        completed.push(target.to_string());
        completed.sort();
        completed.dedup();
        let encoded = serde_json::to_string(&completed)
            .map_err(|err| godwit_result::Error::internal(err.to_string()))?;
        kv_set(handle, KEY_COMPLETED, &encoded)?;
        kv_set(handle, KEY_MIGRATION, "")?;
        Ok(())
    }

    /// Update in-memory state after a committed completion. Returns true
    /// when no uncompleted migration references the attached schema any
    /// more, i.e. the caller should detach it.
    pub fn mark_completed(&self, target: &str) -> bool {
        let mut state = self.write_state();
        state.resolved.insert(target.to_string(), Resolution::Excluded);
        state.completed.insert(target.to_string());
        state.current = None;
        state.started = true;
        state.source_path.is_some()
            && !state
                .resolved
                .values()
                .any(|resolution| matches!(resolution, Resolution::Migrating(_)))
    }

    /// Flip the all-done fast path. Returns true the first time, so the
    /// caller fires the database-migrated notification exactly once.
    pub fn set_done(&self) -> bool {
        let mut state = self.write_state();
        self.all_done.store(true, Ordering::Release);
        if state.done_notified {
            false
        } else {
            state.done_notified = true;
            true
        }
    }

    pub fn batch_size(&self) -> usize {
        self.read_state().batch_size
    }

    /// Adapt the batch size: double under budget, halve on overrun,
    /// clamped to [1, 100].
    pub fn adjust_batch(&self, moved_rows: bool, under_budget: bool) {
        let mut state = self.write_state();
        if under_budget && moved_rows {
            state.batch_size = (state.batch_size * 2).min(100);
        } else if !under_budget {
            state.batch_size = (state.batch_size / 2).max(1);
        }
    }
}

/// Read guard over the registry, held while tampered statements execute.
pub(crate) struct RegistryReadGuard<'a>(RwLockReadGuard<'a, RegistryState>);

impl RegistryReadGuard<'_> {
    /// Snapshot of every still-pending migration for the tamperer.
    pub fn context(&self) -> TamperContext {
        let mut ctx = TamperContext::new();
        for (name, resolution) in &self.0.resolved {
            if self.0.completed.contains(name) {
                continue;
            }
            if let Resolution::Migrating(migration) = resolution {
                ctx.insert(Arc::clone(migration));
            }
        }
        ctx
    }
}

// ----------------------------------------------------------------------
// Persisted marker plumbing
// ----------------------------------------------------------------------

fn kv_table_exists(handle: &mut Handle) -> Result<bool> {
    let rows = handle.query_rows(
        "SELECT count(*) FROM main.sqlite_master WHERE type = 'table' AND name = ?1",
        &[Value::Text(KV_TABLE.to_string())],
    )?;
    Ok(matches!(
        rows.first().and_then(|row| row.first()),
        Some(Value::Integer(n)) if *n > 0
    ))
}

fn kv_get(handle: &mut Handle, key: &str) -> Result<Option<String>> {
    let rows = handle.query_rows(
        "SELECT value FROM wcdb_builtin_kv WHERE key = ?1",
        &[Value::Text(key.to_string())],
    )?;
    Ok(match rows.into_iter().next().and_then(|row| row.into_iter().next()) {
        Some(Value::Text(value)) => Some(value),
        _ => None,
    })
}

fn kv_set(handle: &mut Handle, key: &str, value: &str) -> Result<()> {
    handle.execute(
        "CREATE TABLE IF NOT EXISTS wcdb_builtin_kv (key TEXT PRIMARY KEY, value TEXT)",
        &[],
    )?;
    handle.execute(
        "REPLACE INTO wcdb_builtin_kv (key, value) VALUES (?1, ?2)",
        &[Value::Text(key.to_string()), Value::Text(value.to_string())],
    )?;
    Ok(())
}

fn table_exists(handle: &mut Handle, schema: Option<&str>, table: &str) -> Result<bool> {
    let sql = match schema {
        Some(schema) => format!(
            "SELECT count(*) FROM {}.sqlite_master WHERE type = 'table' AND lower(name) = ?1",
            godwit_sql::parse::quote_identifier(schema)
        ),
        None => {
            "SELECT count(*) FROM main.sqlite_master WHERE type = 'table' AND lower(name) = ?1"
                .to_string()
        }
    };
    let rows = handle.query_rows(&sql, &[Value::Text(table.to_ascii_lowercase())])?;
    Ok(matches!(
        rows.first().and_then(|row| row.first()),
        Some(Value::Integer(n)) if *n > 0
    ))
}

/// Declared column order plus the integer-primary-key column, if any.
fn table_columns(
    handle: &mut Handle,
    schema: Option<&str>,
    table: &str,
) -> Result<(Vec<String>, Option<String>)> {
    let sql = match schema {
        Some(schema) => format!(
            "PRAGMA {}.table_info({})",
            godwit_sql::parse::quote_identifier(schema),
            godwit_sql::parse::quote_identifier(table)
        ),
        None => format!(
            "PRAGMA table_info({})",
            godwit_sql::parse::quote_identifier(table)
        ),
    };
    let rows = handle.query_rows(&sql, &[])?;
    let mut columns = Vec::with_capacity(rows.len());
    let mut primary_keys = 0usize;
    let mut integer_primary_key = None;
    for row in rows {
        let name = match row.get(1) {
            Some(Value::Text(name)) => name.clone(),
            _ => continue,
        };
        let declared = match row.get(2) {
            Some(Value::Text(declared)) => declared.clone(),
            _ => String::new(),
        };
        let pk = matches!(row.get(5), Some(Value::Integer(n)) if *n > 0);
        if pk {
            primary_keys += 1;
            if declared.eq_ignore_ascii_case("INTEGER") {
                integer_primary_key = Some(name.clone());
            }
        }
        columns.push(name);
    }
    if primary_keys != 1 {
        integer_primary_key = None;
    }
    Ok((columns, integer_primary_key))
}
