//! The background stepper: bounded batches of rows moved from source to
//! target, crash-safe because every batch, the source drop, and the marker
//! update commit in one transaction.

use std::time::{Duration, Instant};

use rusqlite::types::Value;

use godwit_result::Result;
use godwit_sql::migrate::{
    batch_delete_statement, batch_insert_statement, count_remaining_statement,
    drop_source_statement,
};

use crate::database::DatabaseInner;
use crate::migration::registry::SOURCE_SCHEMA;
use crate::migration::MigratedInfo;

/// Wall-time target for one `step_migration` unit.
const TIME_BUDGET: Duration = Duration::from_millis(10);

/// Perform one bounded unit of migration work.
///
/// Returns `Ok(true)` once every configured migration has completed (which
/// includes the unconfigured case). A transient `Busy`/`Locked` failure
/// rolls the batch back and reports success with zero rows moved; the next
/// tick retries.
pub(crate) fn step(inner: &DatabaseInner) -> Result<bool> {
    let registry = inner.registry();
    if registry.is_migrated() {
        return Ok(true);
    }

    let mut lease = inner.pool().checkout(true)?;
    registry.ensure_bootstrapped(&mut lease)?;

    let Some(migration) = registry.pick_current(&mut lease)? else {
        // Nothing left anywhere: flip the fast path and tell the world.
        let _ = lease.detach(SOURCE_SCHEMA);
        if registry.set_done() {
            registry.notify(None);
        }
        return Ok(true);
    };
    registry.ensure_attached(&mut lease, std::slice::from_ref(&migration.target_table))?;

    let limit = registry.batch_size();
    let insert = batch_insert_statement(&migration, limit)?;
    let delete = batch_delete_statement(&migration, limit)?;
    let count = count_remaining_statement(&migration)?;

    let started = Instant::now();
    lease.begin_nested()?;
    let batch = (|| -> Result<(usize, i64)> {
        let moved = lease.execute_statement(&insert, &[])?;
        lease.execute_statement(&delete, &[])?;
        let remaining = match lease
            .query_rows_statement(&count, &[])?
            .first()
            .and_then(|row| row.first())
        {
            Some(Value::Integer(n)) => *n,
            _ => 0,
        };
        if remaining == 0 {
            // Drain finished: drop the source and persist completion inside
            // the same transaction, so a crash can never observe one
            // without the other.
            lease.execute_statement(&drop_source_statement(&migration)?, &[])?;
            registry.persist_completion(&mut lease, &migration.target_table)?;
        }
        Ok((moved, remaining))
    })();

    match batch {
        Ok((moved, remaining)) => {
            lease.commit_nested()?;
            registry.adjust_batch(moved > 0, started.elapsed() <= TIME_BUDGET);
            if remaining == 0 {
                tracing::info!(
                    table = %migration.target_table,
                    source = %migration.source_table,
                    "table migrated"
                );
                if registry.mark_completed(&migration.target_table) {
                    let _ = lease.detach(SOURCE_SCHEMA);
                }
                registry.notify(Some(&MigratedInfo {
                    table: migration.target_table.clone(),
                    source_table: migration.source_table.clone(),
                }));
            }
            Ok(false)
        }
        Err(err) if err.is_transient() => {
            let _ = lease.rollback_nested();
            Ok(false)
        }
        Err(err) => {
            let _ = lease.rollback_nested();
            Err(err)
        }
    }
}
