//! Backup material generation from a live connection.

use std::path::Path;

use rusqlite::Connection;

use godwit_result::{Error, Result};

use crate::btree::collect_leaves;
use crate::material::{Material, ObjectKind, SchemaObject};
use crate::pager::FilePager;

/// Decides which tables are worth materializing.
pub type TableFilter = dyn Fn(&str) -> bool + Send + Sync;

/// Capture schema SQL and per-table leaf pages for `db_path`.
///
/// The WAL is folded back first (passively) so the raw file reflects recent
/// commits; pages still only in the WAL after a busy passive checkpoint are
/// picked up by the next backup.
pub fn generate_material(
    conn: &Connection,
    db_path: &Path,
    filter: Option<&TableFilter>,
) -> Result<Material> {
    conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
        .map_err(|err| Error::from(err).with_path(db_path))?;
    let page_size: i64 = conn
        .query_row("PRAGMA page_size", [], |row| row.get(0))
        .map_err(|err| Error::from(err).with_path(db_path))?;

    let mut stmt = conn
        .prepare(
            "SELECT type, name, tbl_name, rootpage, sql FROM sqlite_master \
             WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'",
        )
        .map_err(|err| Error::from(err).with_path(db_path))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(|err| Error::from(err).with_path(db_path))?;

    let mut pager: Option<FilePager> = None;
    let mut objects = Vec::new();
    for row in rows {
        let (kind, name, table_name, root_page, sql) =
            row.map_err(|err| Error::from(err).with_path(db_path))?;
        let Some(kind) = ObjectKind::parse(&kind) else {
            continue;
        };
        if let Some(filter) = filter {
            if !filter(&table_name) {
                continue;
            }
        }
        let root_page = root_page.unwrap_or(0).max(0) as u32;
        let leaf_pages = if kind == ObjectKind::Table && root_page > 0 {
            if pager.is_none() {
                pager = Some(FilePager::open(db_path)?);
            }
            match pager.as_mut() {
                Some(pager) => collect_leaves(pager, root_page, false)?,
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };
        objects.push(SchemaObject {
            kind,
            name,
            sql,
            root_page,
            leaf_pages,
        });
    }

    Ok(Material {
        page_size: page_size.max(0) as u32,
        objects,
    })
}
