//! Process-wide state: global trace callbacks, the default cipher
//! configuration, tokenizer and auxiliary-function registries, the default
//! temporary directory, and the set of live databases.
//!
//! One singleton initialized at first use; all mutation goes through a
//! mutex, reads take copy-on-write snapshots.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use rustc_hash::FxHashMap;

use crate::cipher::CipherVersion;
use crate::database::DatabaseInner;
use crate::fts::{AuxiliaryFunctionModule, LocaleSupport, TokenizerModule};
use crate::trace::TraceHub;

#[derive(Default)]
struct Registries {
    default_cipher_version: Option<CipherVersion>,
    temporary_directory: Option<PathBuf>,
    tokenizers: FxHashMap<String, Arc<dyn TokenizerModule>>,
    auxiliary_functions: FxHashMap<String, Arc<dyn AuxiliaryFunctionModule>>,
    locale: LocaleSupport,
    databases: FxHashMap<PathBuf, Weak<DatabaseInner>>,
}

#[derive(Default)]
struct Globals {
    traces: TraceHub,
    registries: Mutex<Registries>,
}

fn globals() -> &'static Globals {
    static GLOBALS: OnceLock<Globals> = OnceLock::new();
    GLOBALS.get_or_init(Globals::default)
}

fn registries() -> MutexGuard<'static, Registries> {
    globals()
        .registries
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The global trace hub (fires alongside every database's own callbacks).
pub(crate) fn traces() -> &'static TraceHub {
    &globals().traces
}

pub(crate) fn set_default_cipher_version(version: CipherVersion) {
    registries().default_cipher_version = Some(version);
}

pub(crate) fn default_cipher_version() -> Option<CipherVersion> {
    registries().default_cipher_version
}

pub(crate) fn set_temporary_directory(directory: Option<PathBuf>) {
    registries().temporary_directory = directory;
}

pub(crate) fn temporary_directory() -> Option<PathBuf> {
    registries().temporary_directory.clone()
}

pub(crate) fn register_tokenizer(name: &str, module: Arc<dyn TokenizerModule>) {
    registries().tokenizers.insert(name.to_string(), module);
}

pub(crate) fn tokenizer(name: &str) -> Option<Arc<dyn TokenizerModule>> {
    registries().tokenizers.get(name).cloned()
}

pub(crate) fn register_auxiliary_function(name: &str, module: Arc<dyn AuxiliaryFunctionModule>) {
    registries()
        .auxiliary_functions
        .insert(name.to_string(), module);
}

pub(crate) fn auxiliary_function(name: &str) -> Option<Arc<dyn AuxiliaryFunctionModule>> {
    registries().auxiliary_functions.get(name).cloned()
}

pub(crate) fn update_locale(update: impl FnOnce(&mut LocaleSupport)) {
    update(&mut registries().locale);
}

/// Snapshot of the locale helpers, for tokenizer modules.
pub fn locale_support() -> LocaleSupport {
    registries().locale.clone()
}

pub(crate) fn lookup_database(path: &Path) -> Option<Arc<DatabaseInner>> {
    let mut registry = registries();
    match registry.databases.get(path) {
        Some(weak) => match weak.upgrade() {
            Some(inner) => Some(inner),
            None => {
                registry.databases.remove(path);
                None
            }
        },
        None => None,
    }
}

pub(crate) fn register_database(path: &Path, inner: &Arc<DatabaseInner>) {
    registries()
        .databases
        .insert(path.to_path_buf(), Arc::downgrade(inner));
}

pub(crate) fn unregister_database(path: &Path) {
    registries().databases.remove(path);
}

/// Purge the idle handles of every live database.
pub fn purge_all() {
    let pools: Vec<Arc<DatabaseInner>> = {
        let mut registry = registries();
        registry.databases.retain(|_, weak| weak.strong_count() > 0);
        registry
            .databases
            .values()
            .filter_map(|weak| weak.upgrade())
            .collect()
    };
    for inner in pools {
        inner.pool().purge();
    }
}
