//! Error types and result definitions for the godwit database framework.
//!
//! This crate provides the unified error type ([`Error`]) and result type
//! alias ([`Result<T>`]) used throughout all godwit crates. All operations
//! that can fail return `Result<T>`; the error variant carries a typed code
//! plus the context needed to diagnose it (database path, tag, offending SQL
//! excerpt).
//!
//! # Error Philosophy
//!
//! godwit uses a single error struct rather than crate-specific error types.
//!
//! This approach:
//! - Simplifies error handling across crate boundaries
//! - Allows errors to propagate naturally with the `?` operator
//! - Keeps engine result codes ([`Code`]) matchable for programmatic handling
//! - Lets the retry and corruption machinery classify failures uniformly
//!
//! # Error Categories
//!
//! - **Transient** ([`Code::Busy`], [`Code::Locked`]): lock contention inside
//!   the engine; retried with backoff before surfacing
//! - **Fatal corruption** ([`Code::Corrupt`], [`Code::NotADb`]): never
//!   retried; the corruption guard is notified asynchronously
//! - **Caller errors** ([`Code::Misuse`], [`Code::Constraint`],
//!   [`Code::MigrationPrecondition`]): surfaced immediately
//! - **File system** ([`Code::File`]): tagged with the [`FileOp`] that failed
//! - **Everything else**: I/O, interrupt, disk-full, open failures, SQL
//!   compilation

pub mod error;
pub mod result;

pub use error::{Code, Error, FileOp};
pub use result::Result;
