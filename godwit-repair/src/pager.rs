//! Read-only page access to a database file, independent of the engine.
//!
//! Repair reads pages straight from disk so that a corrupt interior node or
//! an unreadable header elsewhere in the file cannot block salvage of the
//! pages that are still intact.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use godwit_result::{Code, Error, Result};

const HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const HEADER_LEN: usize = 100;

/// Positioned reader over the pages of one database file.
#[derive(Debug)]
pub struct FilePager {
    file: File,
    path: PathBuf,
    page_size: usize,
    reserved: usize,
    page_count: u32,
}

impl FilePager {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|err| Error::new(Code::CantOpen, err.to_string()).with_path(path))?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|_| Error::new(Code::NotADb, "file too small for a database header").with_path(path))?;
        if &header[0..16] != HEADER_MAGIC {
            return Err(Error::new(Code::NotADb, "bad database header magic").with_path(path));
        }
        let raw_page_size = u16::from_be_bytes([header[16], header[17]]) as usize;
        let page_size = if raw_page_size == 1 { 65_536 } else { raw_page_size };
        if !(512..=65_536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::new(Code::NotADb, "invalid page size").with_path(path));
        }
        let reserved = header[20] as usize;
        let file_len = file
            .metadata()
            .map_err(|err| Error::file(godwit_result::FileOp::GetAttr, path, err))?
            .len();
        let page_count = (file_len / page_size as u64).min(u32::MAX as u64) as u32;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            reserved,
            page_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes of each page usable for b-tree content.
    pub fn usable(&self) -> usize {
        self.page_size - self.reserved
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Read page `number` (1-based). A page beyond the end of the file or a
    /// short read is reported as corruption, not I/O failure, because repair
    /// routinely probes truncated files.
    pub fn page(&mut self, number: u32) -> Result<Vec<u8>> {
        if number == 0 || number > self.page_count {
            return Err(Error::corrupt(format!("page {number} out of range")).with_path(&self.path));
        }
        let offset = (number as u64 - 1) * self.page_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|err| Error::new(Code::Io, err.to_string()).with_path(&self.path))?;
        let mut page = vec![0u8; self.page_size];
        self.file
            .read_exact(&mut page)
            .map_err(|_| Error::corrupt(format!("short read on page {number}")).with_path(&self.path))?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_database_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-db");
        std::fs::write(&path, b"hello world").unwrap();
        let err = FilePager::open(&path).unwrap_err();
        assert_eq!(err.code, Code::NotADb);
    }

    #[test]
    fn reads_pages_of_a_real_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("real.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             CREATE TABLE t (x INTEGER);
             INSERT INTO t VALUES (42);",
        )
        .unwrap();
        drop(conn);

        let mut pager = FilePager::open(&path).unwrap();
        assert!(pager.page_count() >= 2);
        let first = pager.page(1).unwrap();
        assert_eq!(&first[0..16], HEADER_MAGIC);
        assert!(pager.page(pager.page_count() + 1).is_err());
    }
}
