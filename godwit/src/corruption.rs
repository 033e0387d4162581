//! Corruption detection.
//!
//! Any engine error carrying a corruption code moves the database into a
//! suspected state and schedules an integrity probe on a dedicated
//! connection. Only a confirming probe flips `already_corrupted` and fires
//! the user notification, exactly once per database lifetime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};

use godwit_result::{Code, Error};

pub type CorruptionNotification = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Default)]
struct GuardState {
    suspected: bool,
    corrupted: bool,
    notified: bool,
    probing: bool,
    callback: Option<CorruptionNotification>,
}

pub struct CorruptionGuard {
    path: PathBuf,
    state: Mutex<GuardState>,
}

impl CorruptionGuard {
    pub(crate) fn new(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_path_buf(),
            state: Mutex::new(GuardState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_notification(&self, callback: Option<CorruptionNotification>) {
        self.lock().callback = callback;
    }

    pub fn is_already_corrupted(&self) -> bool {
        self.lock().corrupted
    }

    /// Called by the pool when a handle surfaced `Corrupt` or `NotADb`.
    /// Schedules an asynchronous probe unless one is already running.
    pub(crate) fn report(self: &Arc<Self>, code: Code) {
        debug_assert!(matches!(code, Code::Corrupt | Code::NotADb));
        let mut state = self.lock();
        state.suspected = true;
        if state.probing || state.corrupted {
            return;
        }
        state.probing = true;
        drop(state);

        let guard = Arc::clone(self);
        std::thread::Builder::new()
            .name("godwit-corruption-probe".to_string())
            .spawn(move || {
                let confirmed = probe(&guard.path);
                guard.conclude(confirmed);
            })
            .map(|_| ())
            .unwrap_or_else(|err| {
                tracing::warn!(%err, "could not spawn corruption probe");
                self.lock().probing = false;
            });
    }

    /// Run the integrity probe synchronously.
    pub fn check_if_corrupted(&self) -> bool {
        let confirmed = probe(&self.path);
        self.conclude(confirmed);
        confirmed
    }

    fn conclude(&self, confirmed: bool) {
        let callback = {
            let mut state = self.lock();
            state.probing = false;
            state.suspected = false;
            if !confirmed {
                None
            } else {
                state.corrupted = true;
                if state.notified {
                    None
                } else {
                    state.notified = true;
                    state.callback.clone()
                }
            }
        };
        if let Some(callback) = callback {
            tracing::warn!(path = %self.path.display(), "database confirmed corrupt");
            callback(&self.path);
        }
    }
}

/// `PRAGMA integrity_check` on a dedicated read-only connection. A file
/// that cannot even be opened as a database counts as corrupt; a missing
/// file does not.
fn probe(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn,
        Err(err) => return Error::from(err).is_fatal_corruption(),
    };
    match conn.query_row("PRAGMA integrity_check(1)", [], |row| row.get::<_, String>(0)) {
        Ok(verdict) => !verdict.eq_ignore_ascii_case("ok"),
        Err(err) => Error::from(err).is_fatal_corruption(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sound_database_is_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("ok.db");
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE t (x)")
            .unwrap();
        let guard = CorruptionGuard::new(&db);
        assert!(!guard.check_if_corrupted());
        assert!(!guard.is_already_corrupted());
    }

    #[test]
    fn garbage_file_confirms_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bad.db");
        std::fs::write(&db, vec![0x55u8; 8192]).unwrap();

        let guard = CorruptionGuard::new(&db);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        guard.set_notification(Some(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(guard.check_if_corrupted());
        assert!(guard.is_already_corrupted());
        // Repeated confirmations never refire the notification.
        assert!(guard.check_if_corrupted());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
