//! Rebuild a fresh database from deposited generations.
//!
//! With backup material available, leaf pages are read directly, bypassing
//! possibly-corrupt interior nodes. Without material the schema is salvaged
//! from page 1 and each root is walked leniently, falling back to a linear
//! page scan for tables whose tree cannot be entered at all. Rows keep their
//! original rowids so integer primary keys survive.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::Connection;
use rustc_hash::FxHashSet;

use godwit_result::{Error, Result};
use godwit_sql::parse::quote_identifier;
use godwit_sql::InsertBuilder;

use crate::btree::{self, collect_leaves, decode_leaf};
use crate::factory;
use crate::files;
use crate::material::{self, ObjectKind};
use crate::pager::FilePager;

struct PlanTable {
    name: String,
    sql: String,
    root_page: u32,
    /// Known leaf pages from material; `None` means walk the tree.
    leaf_pages: Option<Vec<u32>>,
}

struct SourcePlan {
    db_file: PathBuf,
    tables: Vec<PlanTable>,
    /// Index / trigger / view SQL, replayed after the data.
    secondary: Vec<String>,
}

struct TableColumn {
    name: String,
    integer_primary_key: bool,
}

/// Reconstruct the database at `db_path` from its deposited generations,
/// depositing the current file first when one exists.
///
/// `progress` receives `(fraction, increment)` after each table. Returns the
/// fraction of decodable rows that made it into the new database.
pub fn retrieve(db_path: &Path, progress: &mut dyn FnMut(f64, f64)) -> Result<f64> {
    if files::file_size(db_path)? > 0 {
        factory::deposit(db_path)?;
    }
    let file_name = db_path
        .file_name()
        .ok_or_else(|| Error::misuse("database path has no file name"))?;

    let mut plans = Vec::new();
    for dir in factory::deposits(db_path)? {
        let db_file = dir.join(file_name);
        if files::file_size(&db_file)? == 0 {
            continue;
        }
        match plan_source(&db_file) {
            Some(plan) => plans.push(plan),
            None => {
                tracing::warn!(source = %db_file.display(), "deposited generation is unreadable");
            }
        }
    }

    let conn =
        Connection::open(db_path).map_err(|err| Error::from(err).with_path(db_path))?;

    let total: usize = plans.iter().map(|plan| plan.tables.len()).sum();
    if total == 0 {
        progress(1.0, 1.0);
        return Ok(1.0);
    }
    let increment = 1.0 / total as f64;

    let mut expected = 0u64;
    let mut recovered = 0u64;
    let mut done = 0usize;
    for plan in &plans {
        let mut pager = match FilePager::open(&plan.db_file) {
            Ok(pager) => pager,
            Err(err) => {
                tracing::warn!(source = %plan.db_file.display(), %err, "skipping source");
                done += plan.tables.len();
                progress(done as f64 * increment, plan.tables.len() as f64 * increment);
                continue;
            }
        };
        let mut claimed: FxHashSet<u32> = FxHashSet::default();
        for table in &plan.tables {
            restore_table(
                &conn,
                &mut pager,
                table,
                &mut claimed,
                &mut expected,
                &mut recovered,
            );
            done += 1;
            progress(done as f64 * increment, increment);
        }
    }

    for plan in &plans {
        for sql in &plan.secondary {
            if let Err(err) = conn.execute_batch(sql) {
                tracing::debug!(%err, "secondary schema object not recreated");
            }
        }
    }

    Ok(if expected == 0 {
        1.0
    } else {
        recovered as f64 / expected as f64
    })
}

fn plan_source(db_file: &Path) -> Option<SourcePlan> {
    if let Some(material) = material::read_latest(db_file) {
        let mut tables = Vec::new();
        let mut secondary = Vec::new();
        for object in &material.objects {
            if object.kind == ObjectKind::Table {
                tables.push(PlanTable {
                    name: object.name.clone(),
                    sql: object.sql.clone(),
                    root_page: object.root_page,
                    leaf_pages: Some(object.leaf_pages.clone()),
                });
            } else {
                secondary.push(object.sql.clone());
            }
        }
        return Some(SourcePlan {
            db_file: db_file.to_path_buf(),
            tables,
            secondary,
        });
    }

    // No material: salvage the schema from page 1 and walk from the roots.
    let mut pager = FilePager::open(db_file).ok()?;
    let rows = btree::master_rows(&mut pager).ok()?;
    let mut tables = Vec::new();
    let mut secondary = Vec::new();
    for row in rows {
        if row.name.starts_with("sqlite_") {
            continue;
        }
        let Some(sql) = row.sql else { continue };
        if row.kind == "table" && row.root_page > 0 {
            tables.push(PlanTable {
                name: row.name,
                sql,
                root_page: row.root_page,
                leaf_pages: None,
            });
        } else {
            secondary.push(sql);
        }
    }
    Some(SourcePlan {
        db_file: db_file.to_path_buf(),
        tables,
        secondary,
    })
}

fn restore_table(
    conn: &Connection,
    pager: &mut FilePager,
    table: &PlanTable,
    claimed: &mut FxHashSet<u32>,
    expected: &mut u64,
    recovered: &mut u64,
) {
    // A newer generation may already have created the table; that is fine.
    if let Err(err) = conn.execute_batch(&table.sql) {
        tracing::debug!(table = %table.name, %err, "schema statement not applied");
    }
    let columns = match table_columns(conn, &table.name) {
        Ok(columns) if !columns.is_empty() => columns,
        _ => {
            tracing::warn!(table = %table.name, "table absent after schema replay");
            return;
        }
    };

    let mut leaves = match &table.leaf_pages {
        Some(pages) => pages.clone(),
        None => collect_leaves(pager, table.root_page, false).unwrap_or_default(),
    };
    if leaves.is_empty() && table.root_page > 0 {
        leaves = linear_scan(pager, claimed, columns.len());
    }
    claimed.extend(leaves.iter().copied());

    let insert_sql = match insert_statement(&table.name, &columns) {
        Ok(sql) => sql,
        Err(err) => {
            tracing::warn!(table = %table.name, %err, "cannot build restore insert");
            return;
        }
    };
    let mut stmt = match conn.prepare(&insert_sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            tracing::warn!(table = %table.name, %err, "cannot prepare restore insert");
            return;
        }
    };

    let ipk = columns.iter().position(|column| column.integer_primary_key);
    for leaf in leaves {
        let rows = match decode_leaf(pager, leaf) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!(table = %table.name, page = leaf, %err, "unreadable leaf");
                continue;
            }
        };
        for row in rows {
            *expected += 1;
            let mut values = row.values;
            values.resize(columns.len(), Value::Null);
            values.truncate(columns.len());
            let params: Vec<Value> = match ipk {
                Some(index) => {
                    if matches!(values[index], Value::Null) {
                        values[index] = Value::Integer(row.rowid);
                    }
                    values
                }
                None => {
                    let mut with_rowid = Vec::with_capacity(values.len() + 1);
                    with_rowid.push(Value::Integer(row.rowid));
                    with_rowid.extend(values);
                    with_rowid
                }
            };
            match stmt.execute(rusqlite::params_from_iter(params)) {
                Ok(_) => *recovered += 1,
                Err(err) => {
                    tracing::debug!(table = %table.name, %err, "row not restored");
                }
            }
        }
    }
}

fn insert_statement(table: &str, columns: &[TableColumn]) -> Result<String> {
    let has_ipk = columns.iter().any(|column| column.integer_primary_key);
    let mut names: Vec<String> = Vec::with_capacity(columns.len() + 1);
    if !has_ipk {
        names.push("rowid".to_string());
    }
    names.extend(columns.iter().map(|column| column.name.clone()));
    let statement = InsertBuilder::into(table)
        .columns_owned(&names)
        .or_ignore()
        .build()?;
    Ok(statement.to_string())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<TableColumn>> {
    let sql = format!("PRAGMA table_info({})", quote_identifier(table));
    let mut stmt = conn.prepare(&sql).map_err(Error::from)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .map_err(Error::from)?;
    let mut columns = Vec::new();
    let mut pk_count = 0;
    for row in rows {
        let (name, declared_type, pk) = row.map_err(Error::from)?;
        if pk > 0 {
            pk_count += 1;
        }
        columns.push((name, declared_type, pk));
    }
    Ok(columns
        .into_iter()
        .map(|(name, declared_type, pk)| TableColumn {
            integer_primary_key: pk == 1
                && pk_count == 1
                && declared_type.eq_ignore_ascii_case("INTEGER"),
            name,
        })
        .collect())
}

/// Last resort: claim every still-unclaimed table leaf whose rows match the
/// expected column count. Ambiguous between same-arity tables, but better
/// than losing the data outright.
fn linear_scan(pager: &mut FilePager, claimed: &FxHashSet<u32>, column_count: usize) -> Vec<u32> {
    let mut pages = Vec::new();
    for page_no in 2..=pager.page_count() {
        if claimed.contains(&page_no) {
            continue;
        }
        let Ok(rows) = decode_leaf(pager, page_no) else {
            continue;
        };
        if !rows.is_empty() && rows.iter().all(|row| row.values.len() == column_count) {
            pages.push(page_no);
        }
    }
    pages
}
