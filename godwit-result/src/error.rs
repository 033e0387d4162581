use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error as ThisError;

/// File system operation that failed, carried by [`Code::File`].
///
/// The variant names mirror the underlying syscalls so an error report can
/// state exactly which primitive failed on which path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOp {
    Lstat,
    Access,
    Link,
    Unlink,
    Remove,
    Mkdir,
    GetAttr,
    SetAttr,
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileOp::Lstat => "lstat",
            FileOp::Access => "access",
            FileOp::Link => "link",
            FileOp::Unlink => "unlink",
            FileOp::Remove => "remove",
            FileOp::Mkdir => "mkdir",
            FileOp::GetAttr => "getattr",
            FileOp::SetAttr => "setattr",
        };
        f.write_str(name)
    }
}

/// Typed error code for every godwit failure.
///
/// The first block mirrors the primary result codes of the SQL engine;
/// the remainder covers the framework's own failure modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    /// Another connection holds a conflicting lock; retried before surfacing.
    Busy,
    /// A lock inside the same process blocks the operation; retried.
    Locked,
    /// I/O failure reported by the engine or the OS.
    Io,
    /// The database image is malformed. Never retried; triggers the
    /// corruption guard.
    Corrupt,
    /// The file is not a database at all (bad header or wrong key).
    NotADb,
    /// The API was used incorrectly.
    Misuse,
    /// A uniqueness, NOT NULL, or foreign-key constraint was violated.
    Constraint,
    /// The operation was interrupted.
    Interrupt,
    /// The disk is full.
    Full,
    /// The database file could not be opened.
    CantOpen,
    /// A file-system primitive failed outside the engine.
    File(FileOp),
    /// A statement violates a migration precondition (ORDER BY / LIMIT on a
    /// mirrored UPDATE or DELETE, partial-column REPLACE, ALTER on a
    /// migrating table).
    MigrationPrecondition,
    /// SQL could not be parsed or compiled.
    Sql,
    /// Violated internal invariant; indicates a bug in godwit.
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Busy => f.write_str("busy"),
            Code::Locked => f.write_str("locked"),
            Code::Io => f.write_str("io error"),
            Code::Corrupt => f.write_str("corrupt"),
            Code::NotADb => f.write_str("not a database"),
            Code::Misuse => f.write_str("misuse"),
            Code::Constraint => f.write_str("constraint violation"),
            Code::Interrupt => f.write_str("interrupted"),
            Code::Full => f.write_str("disk full"),
            Code::CantOpen => f.write_str("cannot open"),
            Code::File(op) => write!(f, "file operation failed: {op}"),
            Code::MigrationPrecondition => f.write_str("migration precondition violated"),
            Code::Sql => f.write_str("sql error"),
            Code::Internal => f.write_str("internal error"),
        }
    }
}

/// Unified error for all godwit operations.
///
/// Every error carries a [`Code`] plus the context available where it was
/// raised: the database path, the database tag, and an excerpt of the SQL
/// being executed. Context is attached as the error propagates upward, so a
/// low-level failure reaching the caller names the database it came from.
#[derive(Clone, Debug, ThisError)]
#[error("{code}: {message}")]
pub struct Error {
    /// Typed failure code.
    pub code: Code,
    /// Free-form description of what went wrong.
    pub message: String,
    /// Database path, when known.
    pub path: Option<PathBuf>,
    /// Database tag, when assigned.
    pub tag: Option<i64>,
    /// Excerpt of the SQL that failed, when any.
    pub sql: Option<String>,
}

impl Error {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
            tag: None,
            sql: None,
        }
    }

    /// Shorthand for a [`Code::Misuse`] error.
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(Code::Misuse, message)
    }

    /// Shorthand for a [`Code::Corrupt`] error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(Code::Corrupt, message)
    }

    /// Shorthand for a [`Code::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Shorthand for a [`Code::MigrationPrecondition`] error.
    pub fn migration_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::MigrationPrecondition, message)
    }

    /// A file-system error tagged with the failing primitive and path.
    pub fn file(op: FileOp, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::new(Code::File(op), source.to_string()).with_path(path)
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.as_ref().to_path_buf());
        }
        self
    }

    pub fn with_tag(mut self, tag: i64) -> Self {
        if self.tag.is_none() && tag != 0 {
            self.tag = Some(tag);
        }
        self
    }

    pub fn with_sql(mut self, sql: &str) -> Self {
        if self.sql.is_none() {
            // Bound the excerpt; statements can embed large blobs.
            let excerpt: String = sql.chars().take(256).collect();
            self.sql = Some(excerpt);
        }
        self
    }

    /// True for lock contention that the engine layer retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, Code::Busy | Code::Locked)
    }

    /// True for codes that mark the database image as suspect. These are
    /// never retried and wake the corruption guard.
    pub fn is_fatal_corruption(&self) -> bool {
        matches!(self.code, Code::Corrupt | Code::NotADb)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err {
            rusqlite::Error::SqliteFailure(ffi, message) => {
                let code = match ffi.code {
                    ErrorCode::DatabaseBusy => Code::Busy,
                    ErrorCode::DatabaseLocked => Code::Locked,
                    ErrorCode::SystemIoFailure => Code::Io,
                    ErrorCode::DatabaseCorrupt => Code::Corrupt,
                    ErrorCode::NotADatabase => Code::NotADb,
                    ErrorCode::ApiMisuse => Code::Misuse,
                    ErrorCode::ConstraintViolation => Code::Constraint,
                    ErrorCode::OperationInterrupted => Code::Interrupt,
                    ErrorCode::DiskFull => Code::Full,
                    ErrorCode::CannotOpen => Code::CantOpen,
                    _ => Code::Sql,
                };
                let message = message.unwrap_or_else(|| ffi.to_string());
                Self::new(code, message)
            }
            other => Self::new(Code::Sql, other.to_string()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(Code::Io, err.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for Error {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        Self::new(Code::Sql, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::new(Code::Busy, "b").is_transient());
        assert!(Error::new(Code::Locked, "l").is_transient());
        assert!(!Error::new(Code::Constraint, "c").is_transient());
        assert!(Error::new(Code::Corrupt, "c").is_fatal_corruption());
        assert!(Error::new(Code::NotADb, "n").is_fatal_corruption());
        assert!(!Error::new(Code::Io, "i").is_fatal_corruption());
    }

    #[test]
    fn sqlite_failure_mapping() {
        let err = rusqlite::Connection::open("/nonexistent-dir/x/y.db").unwrap_err();
        let converted = Error::from(err);
        assert_eq!(converted.code, Code::CantOpen);
    }

    #[test]
    fn context_is_attached_once() {
        let err = Error::corrupt("bad page")
            .with_path("/tmp/a.db")
            .with_path("/tmp/b.db")
            .with_sql("SELECT 1")
            .with_tag(7);
        assert_eq!(err.path.as_deref(), Some(Path::new("/tmp/a.db")));
        assert_eq!(err.sql.as_deref(), Some("SELECT 1"));
        assert_eq!(err.tag, Some(7));
    }

    #[test]
    fn sql_excerpt_is_bounded() {
        let long = "x".repeat(10_000);
        let err = Error::misuse("m").with_sql(&long);
        assert_eq!(err.sql.unwrap().len(), 256);
    }
}
