//! Statement layer for the godwit database framework.
//!
//! godwit manipulates SQL as syntax trees, never as text. This crate wraps
//! [`sqlparser`] with the SQLite dialect and provides three things on top:
//!
//! - **Parsing helpers** ([`parse`]): statement and expression parsing plus
//!   structural accessors (referenced table names, object-name utilities).
//! - **Typed builders** ([`builder`]): chain-call builders that accumulate
//!   clauses and emit a [`Statement`] value. The execution engine only ever
//!   consumes the emitted statement.
//! - **The tamperer** ([`tamper`]): the pure rewriting function that makes
//!   reads and writes against a migration target table behave as if the rows
//!   still resident in the source table had already been copied.
//!
//! All rewriting is deterministic given the same [`tamper::TamperContext`]
//! snapshot, and idempotent on its own output.

pub mod builder;
pub mod migrate;
pub mod parse;
pub mod tamper;

pub use builder::{DeleteBuilder, InsertBuilder, SelectBuilder, TransactionKind, UpdateBuilder};
pub use parse::{parse_all, parse_expr, parse_one, referenced_tables};
pub use tamper::{tamper, TableMigration, TamperContext, TamperedPair};

pub use sqlparser::ast;
pub use sqlparser::ast::Statement;

pub use godwit_result::{Code, Error, Result};
