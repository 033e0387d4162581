//! File primitives shared by deposit, retrieve, and the facade's file
//! operations, with failures tagged by the primitive that raised them.

use std::fs;
use std::path::{Path, PathBuf};

use godwit_result::{Error, FileOp, Result};

/// Move a file by hard link plus unlink, copying when the link fails
/// (e.g. across file systems).
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => {}
        Err(_) => {
            fs::copy(src, dst).map_err(|err| Error::file(FileOp::Link, dst, err))?;
        }
    }
    fs::remove_file(src).map_err(|err| Error::file(FileOp::Unlink, src, err))
}

pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::file(FileOp::Remove, path, err)),
    }
}

/// Size of a file, zero when it does not exist.
pub fn file_size(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(Error::file(FileOp::GetAttr, path, err)),
    }
}

fn suffixed(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Every file belonging to a database path, existing or not: the database
/// itself, journals, and the two material generations.
pub fn related_files(db_path: &Path) -> Vec<PathBuf> {
    vec![
        db_path.to_path_buf(),
        suffixed(db_path, "-journal"),
        suffixed(db_path, "-wal"),
        suffixed(db_path, "-shm"),
        suffixed(db_path, "-first.material"),
        suffixed(db_path, "-last.material"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_file_replaces_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"payload").unwrap();
        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn file_size_of_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_size(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn related_files_cover_journals_and_materials() {
        let files = related_files(Path::new("/data/app.db"));
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "app.db",
                "app.db-journal",
                "app.db-wal",
                "app.db-shm",
                "app.db-first.material",
                "app.db-last.material",
            ]
        );
    }
}
