//! Online cross-table migration.
//!
//! The registry maps target tables to their sources and owns the persisted
//! progress marker; the decorating handle rewrites every statement through
//! the tamperer; the stepper drains sources in bounded batches on a worker
//! thread. User code stays unaware that a target table's rows may still live
//! in its source.

mod handle;
mod registry;
mod stepper;

pub(crate) use handle::MigrationHandle;
pub(crate) use registry::MigrationRegistry;
pub(crate) use stepper::step;

/// What the user's table filter returns for a table that migrates.
#[derive(Clone, Debug)]
pub struct MigrationSource {
    /// The legacy table the rows are drained from.
    pub source_table: String,
    /// Optional row filter (an SQL expression over the shared columns).
    pub filter: Option<String>,
}

/// Payload of the per-table migrated notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigratedInfo {
    pub table: String,
    pub source_table: String,
}
