//! The database facade.
//!
//! A `Database` is a cheap, cloneable reference to the per-path runtime: the
//! shared handle pool, configuration chain, migration registry, corruption
//! guard, and the auto-backup and auto-migration workers. Opening the same
//! path twice yields the same runtime; dropping the last reference quiesces
//! and closes the pool. No engine handle is opened until first use.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rusqlite::types::Value;
use rustc_hash::FxHashMap;

use godwit_repair as repair;
use godwit_result::{Error, FileOp, Result};
use godwit_sql::ast::Statement;
use godwit_sql::{parse_one, parse_all};

use crate::cipher::{CipherConfig, CipherVersion};
use crate::config::{ConfigChain, ConfigFn, Priority};
use crate::corruption::{CorruptionGuard, CorruptionNotification};
use crate::fts::{
    AuxiliaryFunctionModule, PinyinConverter, SymbolDetector, TokenizerModule,
    TraditionalChineseConverter, UnicodeNormalizer,
};
use crate::global;
use crate::handle::CheckpointMode;
use crate::migration::{self, MigratedInfo, MigrationHandle, MigrationRegistry, MigrationSource};
use crate::pool::HandlePool;
use crate::trace::{
    DatabaseOperation, ErrorTraceFn, OperationEvent, OperationTraceFn, PerformanceTraceFn,
    SqlTraceFn, TraceHub, TraceSnapshot,
};
use crate::tracker;

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// Minimum spacing between automatic backups, so steady-state write I/O is
/// not degraded by material regeneration.
const BACKUP_THROTTLE: Duration = Duration::from_secs(10);

/// Idle polling interval of the auto-migration worker.
const AUTO_MIGRATION_TICK: Duration = Duration::from_millis(5);

struct Worker {
    shutdown: Sender<()>,
    join: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        drop(self.shutdown);
        // The worker may itself hold the last strong reference, in which
        // case teardown runs on the worker thread; joining would deadlock.
        if self.join.thread().id() != std::thread::current().id() {
            let _ = self.join.join();
        }
    }
}

pub(crate) struct DatabaseInner {
    id: u64,
    path: PathBuf,
    tag: Arc<AtomicI64>,
    config: Arc<ConfigChain>,
    traces: Arc<TraceHub>,
    pool: Arc<HandlePool>,
    registry: Arc<MigrationRegistry>,
    corruption: Arc<CorruptionGuard>,
    backup_enabled: AtomicBool,
    backup_filter: Mutex<Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>>,
    backup_ping: Mutex<Option<Sender<()>>>,
    backup_worker: Mutex<Option<Worker>>,
    auto_migration: Mutex<Option<Worker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DatabaseInner {
    pub(crate) fn pool(&self) -> &Arc<HandlePool> {
        &self.pool
    }

    pub(crate) fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    fn backup_now(&self) -> Result<()> {
        let lease = self.pool.checkout(false)?;
        let filter = lock(&self.backup_filter).clone();
        let material = repair::generate_material(&lease.conn, &self.path, filter.as_deref())?;
        repair::write_rotating(&self.path, &material)?;
        Ok(())
    }

    fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            global: global::traces().snapshot(),
            local: self.traces.snapshot(),
        }
    }

    fn operation_event(&self, operation: DatabaseOperation) {
        let snapshot = self.snapshot();
        if snapshot.traces_operations() {
            snapshot.on_operation(&OperationEvent {
                operation,
                path: self.path.clone(),
                tag: self.tag.load(Ordering::Relaxed),
                info: FxHashMap::default(),
            });
        }
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.auto_migration).take() {
            worker.stop();
        }
        if let Some(worker) = lock(&self.backup_worker).take() {
            worker.stop();
        }
        self.pool.close(|| {});
    }
}

/// Lazy, multi-handle database object.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (or share) the runtime for `path`. No handle is created yet;
    /// the first operation draws one lazily.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        let path = std::path::absolute(path.as_ref())
            .map_err(|err| Error::file(FileOp::Access, path.as_ref(), err))?;
        if let Some(inner) = global::lookup_database(&path) {
            return Ok(Database { inner });
        }

        let id = NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed);
        let tag = Arc::new(AtomicI64::new(0));
        let config = Arc::new(ConfigChain::new());
        install_default_configs(&config);
        let traces = Arc::new(TraceHub::default());
        let pool = HandlePool::new(&path, id, Arc::clone(&tag), Arc::clone(&config), Arc::clone(&traces));
        let corruption = CorruptionGuard::new(&path);
        {
            let guard = Arc::clone(&corruption);
            pool.set_fatal_sink(Box::new(move |code| guard.report(code)));
        }

        let inner = Arc::new(DatabaseInner {
            id,
            path: path.clone(),
            tag,
            config,
            traces,
            pool,
            registry: Arc::new(MigrationRegistry::new()),
            corruption,
            backup_enabled: AtomicBool::new(false),
            backup_filter: Mutex::new(None),
            backup_ping: Mutex::new(None),
            backup_worker: Mutex::new(None),
            auto_migration: Mutex::new(None),
        });
        {
            let weak = Arc::downgrade(&inner);
            inner.pool.set_write_sink(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if inner.backup_enabled.load(Ordering::Relaxed) {
                        if let Some(ping) = lock(&inner.backup_ping).as_ref() {
                            let _ = ping.try_send(());
                        }
                    }
                }
            }));
        }
        global::register_database(&path, &inner);
        inner.operation_event(DatabaseOperation::Create);
        Ok(Database { inner })
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn set_tag(&self, tag: i64) {
        self.inner.tag.store(tag, Ordering::Relaxed);
        self.inner.operation_event(DatabaseOperation::SetTag);
    }

    pub fn tag(&self) -> i64 {
        self.inner.tag.load(Ordering::Relaxed)
    }

    /// The last error this database produced on the calling thread.
    pub fn last_error(&self) -> Option<Error> {
        tracker::last_error(self.inner.id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn is_opened(&self) -> bool {
        self.inner.pool.is_opened()
    }

    /// Whether a handle can actually be opened (opening lazily as needed).
    pub fn can_open(&self) -> bool {
        self.inner.pool.checkout(false).is_ok()
    }

    pub fn blockade(&self) {
        self.inner.pool.blockade();
    }

    pub fn unblockade(&self) {
        self.inner.pool.unblockade();
    }

    pub fn is_blockaded(&self) -> bool {
        self.inner.pool.is_blockaded()
    }

    pub fn close(&self) {
        self.close_with(|| {});
    }

    /// Quiesce the pool, finalize every handle, and run `on_closed` while
    /// the pool is still blockaded. Later operations reopen lazily.
    pub fn close_with(&self, on_closed: impl FnOnce()) {
        self.inner.pool.close(on_closed);
    }

    /// Finalize the idle handles of this database.
    pub fn purge(&self) {
        self.inner.pool.purge();
    }

    /// Finalize the idle handles of every open database in the process.
    pub fn purge_all() {
        global::purge_all();
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Draw a raw handle lease from the pool. The lease bypasses the
    /// migration engine; statements on it see tables as they physically
    /// are. Returned to the pool on drop.
    pub fn checkout(&self, write_hint: bool) -> Result<crate::pool::HandleLease> {
        self.inner.pool.checkout(write_hint)
    }

    pub fn execute(&self, statement: &Statement) -> Result<usize> {
        self.execute_with(statement, &[])
    }

    pub fn execute_with(&self, statement: &Statement, params: &[Value]) -> Result<usize> {
        let mut lease = self.inner.pool.checkout(true)?;
        let mut handle = MigrationHandle::new(&mut lease, &self.inner.registry);
        handle.execute(statement, params)
    }

    /// Parse and execute one or more statements, returning the change count
    /// of the last one.
    pub fn execute_sql(&self, sql: &str) -> Result<usize> {
        let statements = parse_all(sql)?;
        let mut lease = self.inner.pool.checkout(true)?;
        let mut handle = MigrationHandle::new(&mut lease, &self.inner.registry);
        let mut changes = 0;
        for statement in &statements {
            changes = handle.execute(statement, &[])?;
        }
        Ok(changes)
    }

    pub fn query(&self, statement: &Statement) -> Result<Vec<Vec<Value>>> {
        self.query_with(statement, &[])
    }

    pub fn query_with(&self, statement: &Statement, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        let mut lease = self.inner.pool.checkout(false)?;
        let mut handle = MigrationHandle::new(&mut lease, &self.inner.registry);
        handle.query(statement, params)
    }

    pub fn query_sql(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        let statement = parse_one(sql)?;
        self.query_with(&statement, &[])
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let rows = self.query_with(
            &parse_one(
                "SELECT count(*) FROM main.sqlite_master WHERE type = 'table' AND lower(name) = ?",
            )?,
            &[Value::Text(table.to_ascii_lowercase())],
        )?;
        Ok(matches!(
            rows.first().and_then(|row| row.first()),
            Some(Value::Integer(n)) if *n > 0
        ))
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    pub fn passive_checkpoint(&self) -> Result<()> {
        let mut lease = self.inner.pool.checkout(true)?;
        lease.wal_checkpoint(CheckpointMode::Passive)
    }

    pub fn truncate_checkpoint(&self) -> Result<()> {
        let mut lease = self.inner.pool.checkout(true)?;
        lease.wal_checkpoint(CheckpointMode::Truncate)
    }

    // ------------------------------------------------------------------
    // Tracing
    // ------------------------------------------------------------------

    pub fn trace_error(&self, callback: Option<Arc<ErrorTraceFn>>) {
        self.inner.traces.set_error(callback);
    }

    pub fn trace_sql(&self, callback: Option<Arc<SqlTraceFn>>) {
        self.inner.traces.set_sql(callback);
    }

    pub fn trace_performance(&self, callback: Option<Arc<PerformanceTraceFn>>) {
        self.inner.traces.set_performance(callback);
    }

    pub fn set_full_sql_trace_enable(&self, enable: bool) {
        self.inner.traces.set_full_sql(enable);
    }

    pub fn global_trace_error(callback: Option<Arc<ErrorTraceFn>>) {
        global::traces().set_error(callback);
    }

    pub fn global_trace_sql(callback: Option<Arc<SqlTraceFn>>) {
        global::traces().set_sql(callback);
    }

    pub fn global_trace_performance(callback: Option<Arc<PerformanceTraceFn>>) {
        global::traces().set_performance(callback);
    }

    pub fn global_trace_database_operation(callback: Option<Arc<OperationTraceFn>>) {
        global::traces().set_operation(callback);
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Every path belonging to this database, existing or not.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths = repair::files::related_files(&self.inner.path);
        paths.push(repair::factory_dir(&self.inner.path));
        paths
    }

    pub fn files_size(&self) -> Result<u64> {
        let mut total = 0;
        for path in repair::files::related_files(&self.inner.path) {
            total += repair::files::file_size(&path)?;
        }
        Ok(total)
    }

    /// Remove every file of the database, behind the close barrier.
    pub fn remove_files(&self) -> Result<()> {
        let mut result = Ok(());
        self.inner.pool.close(|| {
            for path in repair::files::related_files(&self.inner.path) {
                if let Err(err) = repair::files::remove_file_if_exists(&path) {
                    result = Err(err);
                    return;
                }
            }
        });
        result
    }

    /// Move every file of the database into `directory`, behind the close
    /// barrier.
    pub fn move_files(&self, directory: &Path) -> Result<()> {
        let mut result = Ok(());
        self.inner.pool.close(|| {
            result = (|| {
                std::fs::create_dir_all(directory)
                    .map_err(|err| Error::file(FileOp::Mkdir, directory, err))?;
                for path in repair::files::related_files(&self.inner.path) {
                    if !path.exists() {
                        continue;
                    }
                    let Some(name) = path.file_name() else {
                        continue;
                    };
                    repair::files::move_file(&path, &directory.join(name))?;
                }
                Ok(())
            })();
        });
        result
    }

    // ------------------------------------------------------------------
    // Full-text search
    // ------------------------------------------------------------------

    pub fn register_tokenizer(name: &str, module: Arc<dyn TokenizerModule>) {
        global::register_tokenizer(name, module);
    }

    /// Arrange for the named (already registered) tokenizer to be available
    /// on every handle of this database.
    pub fn add_tokenizer(&self, name: &str) -> Result<()> {
        let module = global::tokenizer(name)
            .ok_or_else(|| Error::misuse(format!("tokenizer '{name}' is not registered")))?;
        let invoke: ConfigFn = Arc::new(move |handle| module.register(&handle.conn));
        self.inner
            .config
            .set(&format!("godwit.tokenizer.{name}"), invoke, None, Priority::Default);
        Ok(())
    }

    pub fn register_auxiliary_function(name: &str, module: Arc<dyn AuxiliaryFunctionModule>) {
        global::register_auxiliary_function(name, module);
    }

    pub fn add_auxiliary_function(&self, name: &str) -> Result<()> {
        let module = global::auxiliary_function(name).ok_or_else(|| {
            Error::misuse(format!("auxiliary function '{name}' is not registered"))
        })?;
        let invoke: ConfigFn = Arc::new(move |handle| module.register(&handle.conn));
        self.inner
            .config
            .set(&format!("godwit.auxiliary.{name}"), invoke, None, Priority::Default);
        Ok(())
    }

    pub fn config_symbol_detector(detector: SymbolDetector) {
        global::update_locale(|locale| locale.symbol_detector = Some(detector));
    }

    pub fn config_unicode_normalizer(normalizer: UnicodeNormalizer) {
        global::update_locale(|locale| locale.unicode_normalizer = Some(normalizer));
    }

    pub fn config_pinyin_converter(converter: PinyinConverter) {
        global::update_locale(|locale| locale.pinyin_converter = Some(converter));
    }

    pub fn config_traditional_chinese_converter(converter: TraditionalChineseConverter) {
        global::update_locale(|locale| locale.traditional_chinese_converter = Some(converter));
    }

    // ------------------------------------------------------------------
    // Corruption and repair
    // ------------------------------------------------------------------

    pub fn set_notification_when_corrupted(&self, callback: Option<CorruptionNotification>) {
        self.inner.corruption.set_notification(callback);
    }

    /// Probe integrity synchronously.
    pub fn check_if_corrupted(&self) -> bool {
        self.inner.corruption.check_if_corrupted()
    }

    pub fn is_already_corrupted(&self) -> bool {
        self.inner.corruption.is_already_corrupted()
    }

    /// Regenerate backup material now.
    pub fn backup(&self) -> Result<()> {
        self.inner.backup_now()
    }

    /// Restrict which tables are captured by backups.
    pub fn filter_backup(&self, filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>) {
        *lock(&self.inner.backup_filter) = filter;
    }

    /// Regenerate backup material after user writes, coalesced and spaced
    /// at least ten seconds apart, on a worker thread.
    pub fn enable_auto_backup(&self, enable: bool) {
        self.inner.backup_enabled.store(enable, Ordering::Relaxed);
        if !enable {
            *lock(&self.inner.backup_ping) = None;
            if let Some(worker) = lock(&self.inner.backup_worker).take() {
                worker.stop();
            }
            return;
        }
        let mut worker = lock(&self.inner.backup_worker);
        if worker.is_some() {
            return;
        }
        let (ping_tx, ping_rx) = bounded::<()>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        *lock(&self.inner.backup_ping) = Some(ping_tx);
        let weak = Arc::downgrade(&self.inner);
        let join = std::thread::Builder::new()
            .name("godwit-auto-backup".to_string())
            .spawn(move || {
                let mut last: Option<Instant> = None;
                loop {
                    match ping_rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(()) => {}
                        Err(RecvTimeoutError::Timeout) => {
                            // Periodic wakeup to notice shutdown.
                            match shutdown_rx.try_recv() {
                                Ok(()) => break,
                                Err(crossbeam_channel::TryRecvError::Disconnected) => break,
                                Err(crossbeam_channel::TryRecvError::Empty) => continue,
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    // Coalesce: wait out the throttle window, swallowing
                    // further pings that arrive meanwhile.
                    if let Some(previous) = last {
                        let deadline = previous + BACKUP_THROTTLE;
                        let mut disconnected = false;
                        loop {
                            let now = Instant::now();
                            if now >= deadline {
                                break;
                            }
                            match ping_rx.recv_timeout(deadline - now) {
                                Ok(()) => {}
                                Err(RecvTimeoutError::Timeout) => break,
                                Err(RecvTimeoutError::Disconnected) => {
                                    disconnected = true;
                                    break;
                                }
                            }
                        }
                        if disconnected {
                            break;
                        }
                    }
                    while ping_rx.try_recv().is_ok() {}
                    let Some(inner) = weak.upgrade() else { break };
                    if let Err(err) = inner.backup_now() {
                        tracing::warn!(%err, "automatic backup failed");
                    }
                    last = Some(Instant::now());
                }
            });
        match join {
            Ok(join) => {
                *worker = Some(Worker {
                    shutdown: shutdown_tx,
                    join,
                });
            }
            Err(err) => {
                tracing::warn!(%err, "could not spawn auto-backup worker");
            }
        }
    }

    /// Move the database into a timestamped deposit directory and recreate
    /// an empty database at the original path.
    pub fn deposit(&self) -> Result<()> {
        let mut result = Ok(());
        self.inner.pool.close(|| {
            result = repair::deposit(&self.inner.path).map(|_| ());
        });
        result
    }

    pub fn contains_deposited(&self) -> bool {
        repair::contains_deposited(&self.inner.path)
    }

    pub fn remove_deposited(&self) -> Result<()> {
        repair::remove_deposited(&self.inner.path)
    }

    /// Rebuild the database from everything deposited (depositing the
    /// current file first). Progress is reported as (fraction, increment);
    /// the return value is the fraction of rows recovered.
    pub fn retrieve(&self, mut progress: impl FnMut(f64, f64)) -> Result<f64> {
        let mut result = Ok(0.0);
        self.inner.pool.close(|| {
            result = repair::retrieve(&self.inner.path, &mut progress);
        });
        result
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Install or replace a named configuration entry.
    pub fn set_config(
        &self,
        name: &str,
        invoke: ConfigFn,
        uninvoke: Option<ConfigFn>,
        priority: Priority,
    ) {
        self.inner.config.set(name, invoke, uninvoke, priority);
    }

    pub fn remove_config(&self, name: &str) {
        self.inner.config.remove(name);
    }

    /// Configure the encryption key. Cipher configuration always runs at
    /// the highest priority, before any other statement on a fresh handle.
    pub fn set_cipher_key(&self, key: &[u8], page_size: u32, version: CipherVersion) {
        let version = match version {
            CipherVersion::Default => {
                global::default_cipher_version().unwrap_or(CipherVersion::Default)
            }
            explicit => explicit,
        };
        let cipher = CipherConfig::new(key, page_size, version);
        let invoke: ConfigFn = Arc::new(move |handle| {
            handle
                .conn
                .execute_batch(&cipher.pragma_sql(None))
                .map_err(Error::from)
        });
        self.inner
            .config
            .set("godwit.cipher", invoke, None, Priority::Highest);
    }

    /// What [`CipherVersion::Default`] resolves to for new cipher configs.
    pub fn set_default_cipher_configuration(version: CipherVersion) {
        global::set_default_cipher_version(version);
    }

    pub fn set_default_temporary_directory(directory: Option<&Path>) {
        global::set_temporary_directory(directory.map(Path::to_path_buf));
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Configure online migration. `filter` is consulted once per table the
    /// database touches; returning a source makes that table a migration
    /// target. When `source_path` is given the source tables live in that
    /// database, attached on demand (with `source_cipher` when supplied).
    pub fn add_migration<F>(
        &self,
        source_path: Option<&Path>,
        source_cipher: Option<CipherConfig>,
        filter: F,
    ) where
        F: Fn(&str) -> Option<MigrationSource> + Send + Sync + 'static,
    {
        self.inner.registry.configure(
            source_path.map(Path::to_path_buf),
            source_cipher,
            Arc::new(filter),
        );
    }

    /// Perform one bounded unit of migration work. Returns true once every
    /// configured migration has completed.
    pub fn step_migration(&self) -> Result<bool> {
        migration::step(&self.inner)
    }

    /// Run the stepper on a dedicated worker thread until migration
    /// completes.
    pub fn enable_auto_migration(&self, enable: bool) {
        if !enable {
            if let Some(worker) = lock(&self.inner.auto_migration).take() {
                worker.stop();
            }
            return;
        }
        let mut worker = lock(&self.inner.auto_migration);
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let weak = Arc::downgrade(&self.inner);
        let join = std::thread::Builder::new()
            .name("godwit-auto-migration".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(AUTO_MIGRATION_TICK) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                match migration::step(&inner) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(%err, "migration step failed");
                    }
                }
            });
        match join {
            Ok(join) => {
                *worker = Some(Worker {
                    shutdown: shutdown_tx,
                    join,
                });
            }
            Err(err) => {
                tracing::warn!(%err, "could not spawn auto-migration worker");
            }
        }
    }

    /// Fires once per migrated table (with its info) and once more, with no
    /// value, when the whole database has migrated.
    pub fn set_notification_when_migrated(
        &self,
        callback: Option<Arc<dyn Fn(Option<&MigratedInfo>) + Send + Sync>>,
    ) {
        self.inner.registry.set_notification(callback);
    }

    pub fn is_migrated(&self) -> bool {
        self.inner.registry.is_migrated()
    }
}

/// Built-in entries every pool starts with: a busy timeout under the
/// framework's retry loop, WAL journaling, and the process-wide temporary
/// directory when one is set.
fn install_default_configs(config: &ConfigChain) {
    let busy: ConfigFn = Arc::new(|handle| {
        handle
            .conn
            .busy_timeout(Duration::from_secs(3))
            .map_err(Error::from)
    });
    config.set("godwit.busy-timeout", busy, None, Priority::High);

    let journal: ConfigFn = Arc::new(|handle| {
        handle
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(Error::from)
    });
    config.set("godwit.journal-mode", journal, None, Priority::Default);

    let temp_dir: ConfigFn = Arc::new(|handle| {
        if let Some(directory) = global::temporary_directory() {
            let escaped = directory.to_string_lossy().replace('\'', "''");
            handle
                .conn
                .execute_batch(&format!("PRAGMA temp_store_directory = '{escaped}'"))
                .map_err(Error::from)?;
        }
        Ok(())
    });
    config.set("godwit.temp-directory", temp_dir, None, Priority::Default);
}
