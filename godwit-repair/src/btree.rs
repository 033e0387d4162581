//! Table b-tree traversal over raw pages.
//!
//! Two entry points: [`collect_leaves`] walks interior nodes to find the leaf
//! pages of one table, and [`decode_leaf`] turns a leaf page into rows. Both
//! tolerate damage when asked to, so a corrupt interior node loses only the
//! subtree it guarded.

use rusqlite::types::Value;

use godwit_result::{Error, Result};

use crate::pager::FilePager;
use crate::record::{decode_record, read_varint};

const PAGE_INTERIOR_TABLE: u8 = 0x05;
const PAGE_LEAF_TABLE: u8 = 0x0d;

/// One decoded table row.
#[derive(Clone, Debug)]
pub struct RawRow {
    pub rowid: i64,
    pub values: Vec<Value>,
}

/// A row of the schema table salvaged straight from its b-tree.
#[derive(Clone, Debug)]
pub struct MasterRow {
    pub kind: String,
    pub name: String,
    pub table_name: String,
    pub root_page: u32,
    pub sql: Option<String>,
}

fn header_offset(page_no: u32) -> usize {
    // Page 1 starts with the 100-byte database header.
    if page_no == 1 { 100 } else { 0 }
}

fn be_u16(page: &[u8], pos: usize) -> Result<u16> {
    let bytes = page
        .get(pos..pos + 2)
        .ok_or_else(|| Error::corrupt("page header truncated"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(page: &[u8], pos: usize) -> Result<u32> {
    let bytes = page
        .get(pos..pos + 4)
        .ok_or_else(|| Error::corrupt("page header truncated"))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Collect the leaf pages of the table rooted at `root`, depth-first.
///
/// With `strict` set, any malformed page fails the walk. Without it, damaged
/// interior nodes are skipped and the surviving leaves are returned; callers
/// use the lenient mode when salvaging a corrupt file.
pub fn collect_leaves(pager: &mut FilePager, root: u32, strict: bool) -> Result<Vec<u32>> {
    let mut leaves = Vec::new();
    let mut stack = vec![root];
    let mut visited = 0u64;
    let budget = pager.page_count() as u64 + 1;

    while let Some(page_no) = stack.pop() {
        visited += 1;
        if visited > budget {
            return Err(Error::corrupt("b-tree walk exceeded page budget (cycle?)"));
        }
        let outcome = (|| -> Result<()> {
            let page = pager.page(page_no)?;
            let base = header_offset(page_no);
            let kind = *page
                .get(base)
                .ok_or_else(|| Error::corrupt("empty page"))?;
            match kind {
                PAGE_LEAF_TABLE => {
                    leaves.push(page_no);
                    Ok(())
                }
                PAGE_INTERIOR_TABLE => {
                    let cell_count = be_u16(&page, base + 3)? as usize;
                    stack.push(be_u32(&page, base + 8)?);
                    for i in 0..cell_count {
                        let pointer = be_u16(&page, base + 12 + i * 2)? as usize;
                        stack.push(be_u32(&page, pointer)?);
                    }
                    Ok(())
                }
                other => Err(Error::corrupt(format!(
                    "page {page_no} is not part of a table b-tree (type {other:#x})"
                ))),
            }
        })();
        if let Err(err) = outcome {
            if strict {
                return Err(err);
            }
            tracing::debug!(page = page_no, %err, "skipping unreadable b-tree page");
        }
    }
    leaves.sort_unstable();
    leaves.dedup();
    Ok(leaves)
}

/// Decode every cell of a table leaf page, following overflow chains.
pub fn decode_leaf(pager: &mut FilePager, page_no: u32) -> Result<Vec<RawRow>> {
    let page = pager.page(page_no)?;
    let base = header_offset(page_no);
    let kind = *page
        .get(base)
        .ok_or_else(|| Error::corrupt("empty page"))?;
    if kind != PAGE_LEAF_TABLE {
        return Err(Error::corrupt(format!(
            "page {page_no} is not a table leaf (type {kind:#x})"
        )));
    }
    let cell_count = be_u16(&page, base + 3)? as usize;
    let mut rows = Vec::with_capacity(cell_count);
    for i in 0..cell_count {
        let pointer = be_u16(&page, base + 8 + i * 2)? as usize;
        let (payload_len, pos) = read_varint(&page, pointer)?;
        let (rowid, pos) = read_varint(&page, pos)?;
        let payload_len = usize::try_from(payload_len)
            .map_err(|_| Error::corrupt("negative cell payload length"))?;
        let payload = read_payload(pager, &page, pos, payload_len)?;
        let values = decode_record(&payload)?;
        rows.push(RawRow { rowid, values });
    }
    Ok(rows)
}

/// Assemble a cell payload, reading overflow pages when it spills.
fn read_payload(
    pager: &mut FilePager,
    page: &[u8],
    pos: usize,
    payload_len: usize,
) -> Result<Vec<u8>> {
    let usable = pager.usable();
    let max_local = usable - 35;
    let local = if payload_len <= max_local {
        payload_len
    } else {
        let min_local = (usable - 12) * 32 / 255 - 23;
        let k = min_local + (payload_len - min_local) % (usable - 4);
        if k <= max_local { k } else { min_local }
    };

    let mut payload = page
        .get(pos..pos + local)
        .ok_or_else(|| Error::corrupt("cell payload truncated"))?
        .to_vec();
    if local == payload_len {
        return Ok(payload);
    }

    let mut next = be_u32(page, pos + local)?;
    let mut hops = 0u64;
    while payload.len() < payload_len {
        if next == 0 {
            return Err(Error::corrupt("overflow chain ended early"));
        }
        hops += 1;
        if hops > pager.page_count() as u64 {
            return Err(Error::corrupt("overflow chain exceeded page budget (cycle?)"));
        }
        let overflow = pager.page(next)?;
        next = be_u32(&overflow, 0)?;
        let take = (payload_len - payload.len()).min(usable - 4);
        let chunk = overflow
            .get(4..4 + take)
            .ok_or_else(|| Error::corrupt("overflow page truncated"))?;
        payload.extend_from_slice(chunk);
    }
    Ok(payload)
}

/// Salvage the schema table (rooted at page 1) without consulting the engine.
pub fn master_rows(pager: &mut FilePager) -> Result<Vec<MasterRow>> {
    let mut out = Vec::new();
    let leaves = collect_leaves(pager, 1, false)?;
    for leaf in leaves {
        let rows = match decode_leaf(pager, leaf) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!(page = leaf, %err, "skipping unreadable schema leaf");
                continue;
            }
        };
        for row in rows {
            if let Some(master) = master_row(row.values) {
                out.push(master);
            }
        }
    }
    Ok(out)
}

fn master_row(values: Vec<Value>) -> Option<MasterRow> {
    let mut iter = values.into_iter();
    let kind = text(iter.next()?)?;
    let name = text(iter.next()?)?;
    let table_name = text(iter.next()?)?;
    let root_page = match iter.next()? {
        Value::Integer(n) if n >= 0 => n as u32,
        Value::Null => 0,
        _ => return None,
    };
    let sql = match iter.next() {
        Some(Value::Text(sql)) => Some(sql),
        _ => None,
    };
    Some(MasterRow {
        kind,
        name,
        table_name,
        root_page,
        sql,
    })
}

fn text(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_db(rows: usize) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);",
        )
        .unwrap();
        let mut insert = conn
            .prepare("INSERT INTO t (id, v) VALUES (?1, ?2)")
            .unwrap();
        for i in 0..rows {
            insert
                .execute(rusqlite::params![i as i64 + 1, format!("value-{i}")])
                .unwrap();
        }
        drop(insert);
        drop(conn);
        (dir, path)
    }

    #[test]
    fn walks_a_multi_page_tree() {
        // Enough rows to force interior nodes.
        let (_dir, path) = populated_db(5_000);
        let mut pager = FilePager::open(&path).unwrap();
        let leaves = collect_leaves(&mut pager, 2, true).unwrap();
        assert!(leaves.len() > 1, "expected a multi-page tree");

        let mut total = 0usize;
        for leaf in leaves {
            total += decode_leaf(&mut pager, leaf).unwrap().len();
        }
        assert_eq!(total, 5_000);
    }

    #[test]
    fn overflow_payloads_are_reassembled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overflow.db");
        let big = "x".repeat(100_000);
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA journal_mode = DELETE; CREATE TABLE t (v TEXT);")
            .unwrap();
        conn.execute("INSERT INTO t (v) VALUES (?1)", [&big]).unwrap();
        drop(conn);

        let mut pager = FilePager::open(&path).unwrap();
        let leaves = collect_leaves(&mut pager, 2, true).unwrap();
        let mut rows = Vec::new();
        for leaf in leaves {
            rows.extend(decode_leaf(&mut pager, leaf).unwrap());
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![Value::Text(big)]);
    }

    #[test]
    fn master_rows_lists_schema_objects() {
        let (_dir, path) = populated_db(3);
        let mut pager = FilePager::open(&path).unwrap();
        let rows = master_rows(&mut pager).unwrap();
        let table = rows.iter().find(|row| row.name == "t").unwrap();
        assert_eq!(table.kind, "table");
        assert!(table.sql.as_ref().unwrap().contains("CREATE TABLE"));
        assert!(table.root_page >= 2);
    }
}
