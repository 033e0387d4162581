use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use godwit::{ConfigFn, Database, Priority, Value};

fn temp_db(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join(name);
    (dir, db)
}

#[test]
fn open_is_lazy_and_shared_per_path() {
    let (_dir, path) = temp_db("shared.db");
    let db = Database::open(&path).unwrap();
    assert!(!db.is_opened());

    let again = Database::open(&path).unwrap();
    db.execute_sql("CREATE TABLE t (x INTEGER)").unwrap();
    // The second facade sees the same runtime and the same schema.
    assert!(again.is_opened());
    assert!(again.table_exists("t").unwrap());
}

#[test]
fn close_waits_for_leases_and_runs_the_callback_quiesced() {
    let (_dir, path) = temp_db("close.db");
    let db = Database::open(&path).unwrap();
    db.execute_sql("CREATE TABLE t (x INTEGER)").unwrap();

    let hold = Duration::from_millis(200);
    let worker = {
        let db = db.clone();
        std::thread::spawn(move || {
            let lease = db.checkout(true).unwrap();
            std::thread::sleep(hold);
            drop(lease);
        })
    };
    // Give the worker time to take its lease.
    std::thread::sleep(Duration::from_millis(50));

    let observed_open = Arc::new(AtomicBool::new(true));
    let observed = Arc::clone(&observed_open);
    let started = Instant::now();
    let inner_db = db.clone();
    db.close_with(move || {
        observed.store(inner_db.is_opened(), Ordering::SeqCst);
    });
    // Close blocked until the in-flight lease returned, and its callback
    // saw a pool with no handles at all.
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(!observed_open.load(Ordering::SeqCst));
    worker.join().unwrap();

    // Later operations reopen lazily, from any thread.
    let rows = db.query_sql("SELECT count(*) FROM t").unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(0)]]);
}

#[test]
fn blockade_defers_checkouts_until_lifted() {
    let (_dir, path) = temp_db("blockade.db");
    let db = Database::open(&path).unwrap();
    db.execute_sql("CREATE TABLE t (x INTEGER)").unwrap();

    db.blockade();
    assert!(db.is_blockaded());
    let waiter = {
        let db = db.clone();
        std::thread::spawn(move || {
            let started = Instant::now();
            db.execute_sql("INSERT INTO t (x) VALUES (1)").unwrap();
            started.elapsed()
        })
    };
    std::thread::sleep(Duration::from_millis(120));
    db.unblockade();
    let waited = waiter.join().unwrap();
    assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
    assert!(!db.is_blockaded());
}

#[test]
fn cipher_priority_runs_before_default_regardless_of_order() {
    for reversed in [false, true] {
        let (_dir, path) = temp_db("priority.db");
        let db = Database::open(&path).unwrap();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let cipher_probe: ConfigFn = {
            let order = Arc::clone(&order);
            Arc::new(move |_| {
                order.lock().unwrap().push("cipher");
                Ok(())
            })
        };
        let pragma_probe: ConfigFn = {
            let order = Arc::clone(&order);
            Arc::new(move |_| {
                order.lock().unwrap().push("journal");
                Ok(())
            })
        };
        if reversed {
            db.set_config("probe.journal", pragma_probe, None, Priority::Default);
            db.set_config("probe.cipher", cipher_probe, None, Priority::Highest);
        } else {
            db.set_config("probe.cipher", cipher_probe, None, Priority::Highest);
            db.set_config("probe.journal", pragma_probe, None, Priority::Default);
        }

        db.execute_sql("CREATE TABLE t (x INTEGER)").unwrap();
        let order = order.lock().unwrap();
        assert_eq!(order.as_slice(), &["cipher", "journal"], "reversed = {reversed}");
    }
}

#[test]
fn config_applies_once_per_handle_across_reuse() {
    let (_dir, path) = temp_db("once.db");
    let db = Database::open(&path).unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let probe: ConfigFn = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    db.set_config("probe.count", probe, None, Priority::Default);

    db.execute_sql("CREATE TABLE t (x INTEGER)").unwrap();
    db.execute_sql("INSERT INTO t (x) VALUES (1)").unwrap();
    db.execute_sql("INSERT INTO t (x) VALUES (2)").unwrap();
    // Same thread, same pooled handle: the entry ran exactly once.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn removing_a_config_uninvokes_it_on_live_handles() {
    let (_dir, path) = temp_db("uninvoke.db");
    let db = Database::open(&path).unwrap();

    let invoke: ConfigFn = Arc::new(|handle| {
        handle.execute("PRAGMA user_version = 7", &[])?;
        Ok(())
    });
    let uninvoke: ConfigFn = Arc::new(|handle| {
        handle.execute("PRAGMA user_version = 0", &[])?;
        Ok(())
    });
    db.set_config("probe.version", invoke, Some(uninvoke), Priority::Default);

    let version = db.query_sql("PRAGMA user_version").unwrap();
    assert_eq!(version, vec![vec![Value::Integer(7)]]);

    db.remove_config("probe.version");
    let version = db.query_sql("PRAGMA user_version").unwrap();
    assert_eq!(version, vec![vec![Value::Integer(0)]]);
}

#[test]
fn purge_finalizes_idle_handles() {
    let (_dir, path) = temp_db("purge.db");
    let db = Database::open(&path).unwrap();
    db.execute_sql("CREATE TABLE t (x INTEGER)").unwrap();
    assert!(db.is_opened());
    db.purge();
    assert!(!db.is_opened());
    // And the database is still usable afterwards.
    db.execute_sql("INSERT INTO t (x) VALUES (1)").unwrap();
}

#[test]
fn parallel_threads_each_get_a_working_handle() {
    let (_dir, path) = temp_db("parallel.db");
    let db = Database::open(&path).unwrap();
    db.execute_sql("CREATE TABLE t (x INTEGER)").unwrap();

    let mut workers = Vec::new();
    for i in 0..8i64 {
        let db = db.clone();
        workers.push(std::thread::spawn(move || {
            db.execute_with(
                &godwit::InsertBuilder::into("t").columns(&["x"]).build().unwrap(),
                &[Value::Integer(i)],
            )
            .unwrap();
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    let rows = db.query_sql("SELECT count(*) FROM t").unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(8)]]);
}

#[test]
fn tag_and_last_error_are_tracked() {
    let (_dir, path) = temp_db("tag.db");
    let db = Database::open(&path).unwrap();
    db.set_tag(42);
    assert_eq!(db.tag(), 42);

    assert!(db.execute_sql("INSERT INTO missing VALUES (1)").is_err());
    let last = db.last_error().unwrap();
    assert_eq!(last.tag, Some(42));
    assert!(last.sql.as_deref().unwrap().contains("missing"));
}
