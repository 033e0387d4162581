//! Corruption repair for the godwit database framework.
//!
//! Four layers, bottom up:
//!
//! - [`pager`]: read-only page access to a database file, independent of the
//!   engine, so damaged regions cannot block reads of intact ones.
//! - [`record`] and [`btree`]: decoding of table b-trees and their
//!   serial-type records, tolerant of damage when walking leniently.
//! - [`material`] and [`backup`]: the compact sidecar capturing schema SQL
//!   and per-table leaf page numbers, kept in two alternating generations so
//!   one good copy always survives a crash mid-write.
//! - [`factory`] and [`retrieve`]: deposit of a broken database into a
//!   timestamped side directory and best-effort reconstruction of a fresh
//!   one from everything deposited, with progress reporting.

pub mod backup;
pub mod btree;
pub mod factory;
pub mod files;
pub mod material;
pub mod pager;
pub mod record;
pub mod retrieve;

pub use backup::{generate_material, TableFilter};
pub use factory::{contains_deposited, deposit, deposits, factory_dir, remove_deposited};
pub use material::{material_paths, read_latest, write_rotating, Material, ObjectKind, SchemaObject};
pub use pager::FilePager;
pub use retrieve::retrieve;

pub use godwit_result::{Code, Error, Result};
