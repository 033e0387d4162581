//! Deposit: atomic relocation of a (possibly corrupt) database into a
//! timestamped side directory, leaving a fresh empty database at the
//! original path. Retrieve later merges deposited data back.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use godwit_result::{Error, FileOp, Result};

use crate::files::{move_file, related_files};

/// `<db>.factory`, the side directory holding deposited generations.
pub fn factory_dir(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".factory");
    PathBuf::from(name)
}

/// Move the database and its companion files into a fresh timestamped
/// sub-directory, then create a new empty database at the original path.
pub fn deposit(db_path: &Path) -> Result<PathBuf> {
    let factory = factory_dir(db_path);
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut target = factory.join(stamp.to_string());
    let mut bump = 0u32;
    while target.exists() {
        bump += 1;
        target = factory.join(format!("{stamp}-{bump}"));
    }
    fs::create_dir_all(&target).map_err(|err| Error::file(FileOp::Mkdir, &target, err))?;

    for file in related_files(db_path) {
        if !file.exists() {
            continue;
        }
        let dest = target.join(
            file.file_name()
                .ok_or_else(|| Error::misuse("database path has no file name"))?,
        );
        move_file(&file, &dest)?;
    }

    // Leave a fresh empty database behind so the path stays openable.
    rusqlite::Connection::open(db_path).map_err(|err| Error::from(err).with_path(db_path))?;

    tracing::info!(db = %db_path.display(), deposit = %target.display(), "database deposited");
    Ok(target)
}

/// True when at least one deposited generation exists.
pub fn contains_deposited(db_path: &Path) -> bool {
    deposits(db_path).map(|dirs| !dirs.is_empty()).unwrap_or(false)
}

/// Deposited generation directories, newest first.
pub fn deposits(db_path: &Path) -> Result<Vec<PathBuf>> {
    let factory = factory_dir(db_path);
    let entries = match fs::read_dir(&factory) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::file(FileOp::Access, &factory, err)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::file(FileOp::Access, &factory, err))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    dirs.reverse();
    Ok(dirs)
}

/// Remove every deposited generation.
pub fn remove_deposited(db_path: &Path) -> Result<()> {
    let factory = factory_dir(db_path);
    match fs::remove_dir_all(&factory) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::file(FileOp::Remove, &factory, err)),
    }
}
