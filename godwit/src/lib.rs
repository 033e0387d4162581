//! godwit: an embedded SQLite framework with pooled handles, online
//! cross-table migration, and corruption repair.
//!
//! The facade is [`Database`]: a lazy, cheaply cloneable reference to the
//! per-path runtime. Opening a database creates no engine handle; the first
//! operation draws one from the shared [`pool`](crate::pool), which applies
//! the ordered [`config`](crate::config) chain on first use and hands back
//! an RAII lease.
//!
//! # Crate Topology
//!
//! godwit ships as a layered workspace:
//!
//! - `godwit-result` defines the unified error and result types.
//! - `godwit-sql` wraps [`sqlparser`](https://docs.rs/sqlparser) with the
//!   SQLite dialect: parsing, typed builders, and the migration tamperer.
//! - `godwit-repair` reads database files page by page: backup material,
//!   deposit, and best-effort retrieval.
//! - `godwit` (this crate) is the runtime: handles, the pool, the
//!   configuration chain, the migration engine, and the corruption guard.
//!
//! # Online Migration
//!
//! [`Database::add_migration`] makes reads and writes against a target
//! table behave as if the rows still resident in a distinct source table
//! had already been copied: statements are rewritten on the way into the
//! engine (reads become a `UNION ALL` of both tables, writes gain a shadow
//! that mirrors the mutation onto the source), while
//! [`Database::step_migration`] and the auto-migration worker drain the
//! source in bounded batches. Progress is persisted in the
//! `wcdb_builtin_kv` table and survives process crashes.
//!
//! # Corruption Repair
//!
//! Engine errors carrying corruption codes flip the database into a
//! suspected state, probed and confirmed by the
//! [`corruption`](crate::corruption) guard. [`Database::enable_auto_backup`]
//! maintains compact backup material (schema SQL plus per-table leaf page
//! numbers) in two alternating generations; [`Database::retrieve`] rebuilds
//! a fresh database from deposited copies, reading leaf pages directly so
//! corrupt interior nodes cannot take intact rows with them.

pub mod cipher;
pub mod config;
pub mod corruption;
pub mod database;
pub mod fts;
pub mod global;
pub mod handle;
pub mod migration;
pub mod pool;
pub mod trace;

mod tracker;

pub use cipher::{CipherConfig, CipherVersion, DEFAULT_CIPHER_PAGE_SIZE};
pub use config::{ConfigFn, Priority};
pub use corruption::CorruptionNotification;
pub use database::Database;
pub use fts::{AuxiliaryFunctionModule, TokenizerModule};
pub use global::{locale_support, purge_all};
pub use handle::{CheckpointMode, Handle};
pub use migration::{MigratedInfo, MigrationSource};
pub use pool::{HandleLease, HandlePool};
pub use trace::{DatabaseOperation, OperationEvent, TraceSet};

pub use godwit_result::{Code, Error, FileOp, Result};
pub use godwit_sql::{
    DeleteBuilder, InsertBuilder, SelectBuilder, TransactionKind, UpdateBuilder,
};

/// Engine value type used for bindings and query results.
pub use rusqlite::types::Value;
