use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use godwit::{Database, MigratedInfo, MigrationSource, Value};

fn temp_db(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join(name);
    (dir, db)
}

fn migrate_t_from_t_old(db: &Database) {
    db.add_migration(None, None, |table| {
        (table == "t").then(|| MigrationSource {
            source_table: "t_old".to_string(),
            filter: Some("1 = 1".to_string()),
        })
    });
}

fn seed_split_tables(db: &Database) {
    db.execute_sql(
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
         CREATE TABLE t_old (id INTEGER PRIMARY KEY, v TEXT);
         INSERT INTO t_old (id, v) VALUES (1, 'a'), (2, 'b');",
    )
    .unwrap();
}

#[test]
fn transparent_select_unions_target_and_source() {
    let (_dir, path) = temp_db("select.db");
    let db = Database::open(&path).unwrap();
    seed_split_tables(&db);
    migrate_t_from_t_old(&db);

    let rows = db.query_sql("SELECT id, v FROM t ORDER BY id").unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Integer(1), Value::Text("a".to_string())],
            vec![Value::Integer(2), Value::Text("b".to_string())],
        ]
    );
}

#[test]
fn delete_is_mirrored_to_the_source_table() {
    let (_dir, path) = temp_db("delete.db");
    let db = Database::open(&path).unwrap();
    seed_split_tables(&db);
    migrate_t_from_t_old(&db);

    db.execute_sql("DELETE FROM t WHERE id = 1").unwrap();

    // Through the migration engine the row is gone.
    let rows = db.query_sql("SELECT id FROM t ORDER BY id").unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(2)]]);

    // And physically: neither table holds id = 1 any more.
    let mut lease = db.checkout(false).unwrap();
    let target = lease
        .query_rows("SELECT count(*) FROM t WHERE id = 1", &[])
        .unwrap();
    let source = lease
        .query_rows("SELECT count(*) FROM t_old WHERE id = 1", &[])
        .unwrap();
    assert_eq!(target, vec![vec![Value::Integer(0)]]);
    assert_eq!(source, vec![vec![Value::Integer(0)]]);
}

#[test]
fn stepping_drains_the_source_and_notifies() {
    let (_dir, path) = temp_db("step.db");
    let db = Database::open(&path).unwrap();
    seed_split_tables(&db);
    migrate_t_from_t_old(&db);

    let events: Arc<Mutex<Vec<Option<MigratedInfo>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    db.set_notification_when_migrated(Some(Arc::new(move |info| {
        sink.lock().unwrap().push(info.cloned());
    })));

    // Touch the engine first so both rows are visible through the union.
    let rows = db.query_sql("SELECT id FROM t ORDER BY id").unwrap();
    assert_eq!(rows.len(), 2);

    for _ in 0..64 {
        if db.step_migration().unwrap() {
            break;
        }
    }
    assert!(db.is_migrated());

    // The source is gone; reads now hit the target directly.
    assert!(!db.table_exists("t_old").unwrap());
    let rows = db.query_sql("SELECT v FROM t WHERE id = 2").unwrap();
    assert_eq!(rows, vec![vec![Value::Text("b".to_string())]]);

    let events = events.lock().unwrap();
    assert_eq!(
        events.as_slice(),
        &[
            Some(MigratedInfo {
                table: "t".to_string(),
                source_table: "t_old".to_string(),
            }),
            None,
        ]
    );
}

#[test]
fn insert_with_explicit_key_displaces_the_source_row() {
    let (_dir, path) = temp_db("insert.db");
    let db = Database::open(&path).unwrap();
    seed_split_tables(&db);
    migrate_t_from_t_old(&db);

    // Rewriting id = 1 through the target must remove the stale source row,
    // otherwise the union would show the row twice.
    db.execute_sql("INSERT INTO t (id, v) VALUES (1, 'fresh')")
        .unwrap();
    let rows = db.query_sql("SELECT id, v FROM t ORDER BY id").unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Integer(1), Value::Text("fresh".to_string())],
            vec![Value::Integer(2), Value::Text("b".to_string())],
        ]
    );
}

#[test]
fn update_matching_only_source_rows_stays_in_the_source() {
    let (_dir, path) = temp_db("update.db");
    let db = Database::open(&path).unwrap();
    seed_split_tables(&db);
    migrate_t_from_t_old(&db);

    db.execute_sql("UPDATE t SET v = 'z' WHERE id = 2").unwrap();

    // Visible through the union.
    let rows = db.query_sql("SELECT v FROM t WHERE id = 2").unwrap();
    assert_eq!(rows, vec![vec![Value::Text("z".to_string())]]);

    // But the row still physically lives in the source until stepped.
    let mut lease = db.checkout(false).unwrap();
    let target = lease.query_rows("SELECT count(*) FROM t", &[]).unwrap();
    let source = lease
        .query_rows("SELECT v FROM t_old WHERE id = 2", &[])
        .unwrap();
    assert_eq!(target, vec![vec![Value::Integer(0)]]);
    assert_eq!(source, vec![vec![Value::Text("z".to_string())]]);
}

#[test]
fn empty_source_completes_on_the_first_step() {
    let (_dir, path) = temp_db("empty.db");
    let db = Database::open(&path).unwrap();
    db.execute_sql(
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
         CREATE TABLE t_old (id INTEGER PRIMARY KEY, v TEXT);",
    )
    .unwrap();
    migrate_t_from_t_old(&db);

    let events: Arc<Mutex<Vec<Option<MigratedInfo>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    db.set_notification_when_migrated(Some(Arc::new(move |info| {
        sink.lock().unwrap().push(info.cloned());
    })));

    assert!(!db.step_migration().unwrap());
    assert!(!db.table_exists("t_old").unwrap());
    assert!(db.step_migration().unwrap());
    assert!(db.is_migrated());
    assert_eq!(events.lock().unwrap().len(), 2);
}

#[test]
fn progress_marker_survives_a_reopen() {
    let (_dir, path) = temp_db("resume.db");
    {
        let db = Database::open(&path).unwrap();
        db.execute_sql(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
             CREATE TABLE t_old (id INTEGER PRIMARY KEY, v TEXT);",
        )
        .unwrap();
        let mut lease = db.checkout(true).unwrap();
        for i in 0..40i64 {
            lease
                .execute(
                    "INSERT INTO t_old (id, v) VALUES (?, ?)",
                    &[Value::Integer(i + 1), Value::Text(format!("row-{i}"))],
                )
                .unwrap();
        }
        drop(lease);
        migrate_t_from_t_old(&db);
        // One bounded step: some rows move, the marker is persisted, and
        // the source still holds the rest.
        assert!(!db.step_migration().unwrap());
        assert!(!db.is_migrated());
    }

    // "Restart": the previous runtime is gone; the marker seeds the new one.
    let db = Database::open(&path).unwrap();
    migrate_t_from_t_old(&db);
    for _ in 0..256 {
        if db.step_migration().unwrap() {
            break;
        }
    }
    assert!(db.is_migrated());
    assert!(!db.table_exists("t_old").unwrap());

    // Every row arrived exactly once.
    let rows = db
        .query_sql("SELECT count(*), count(DISTINCT id) FROM t")
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(40), Value::Integer(40)]]);
}

#[test]
fn attached_source_database_is_drained_and_detached() {
    let (_dir, path) = temp_db("attached.db");
    let source_path = path.with_extension("old");
    {
        let source = rusqlite::Connection::open(&source_path).unwrap();
        source
            .execute_batch(
                "CREATE TABLE t_old (id INTEGER PRIMARY KEY, v TEXT);
                 INSERT INTO t_old (id, v) VALUES (1, 'a'), (2, 'b');",
            )
            .unwrap();
    }

    let db = Database::open(&path).unwrap();
    db.execute_sql("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    db.add_migration(Some(&source_path), None, |table| {
        (table == "t").then(|| MigrationSource {
            source_table: "t_old".to_string(),
            filter: None,
        })
    });

    let rows = db.query_sql("SELECT id, v FROM t ORDER BY id").unwrap();
    assert_eq!(rows.len(), 2);

    for _ in 0..64 {
        if db.step_migration().unwrap() {
            break;
        }
    }
    assert!(db.is_migrated());
    let rows = db.query_sql("SELECT id FROM t ORDER BY id").unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]);

    // The drained source table is gone from the attached database.
    let source = rusqlite::Connection::open(&source_path).unwrap();
    let remaining: i64 = source
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 't_old'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(remaining, 0);
}

#[test]
fn concurrent_stepping_and_writes_serialize() {
    let (_dir, path) = temp_db("concurrent.db");
    let db = Database::open(&path).unwrap();
    db.execute_sql(
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
         CREATE TABLE t_old (id INTEGER PRIMARY KEY, v TEXT);",
    )
    .unwrap();
    {
        let mut lease = db.checkout(true).unwrap();
        for i in 0..200i64 {
            lease
                .execute(
                    "INSERT INTO t_old (id, v) VALUES (?, ?)",
                    &[Value::Integer(i + 1), Value::Text(format!("old-{i}"))],
                )
                .unwrap();
        }
    }
    migrate_t_from_t_old(&db);

    let stepper = {
        let db = db.clone();
        std::thread::spawn(move || {
            for _ in 0..1024 {
                if db.step_migration().unwrap() {
                    break;
                }
            }
        })
    };
    // Concurrent user writes against the same target table.
    for i in 200..240i64 {
        db.execute_with(
            &godwit::InsertBuilder::into("t")
                .columns(&["id", "v"])
                .build()
                .unwrap(),
            &[Value::Integer(i + 1), Value::Text(format!("new-{i}"))],
        )
        .unwrap();
    }
    stepper.join().unwrap();
    assert!(db.is_migrated());

    let rows = db
        .query_sql("SELECT count(*), count(DISTINCT id) FROM t")
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(240), Value::Integer(240)]]);
}

#[test]
fn auto_migration_worker_runs_to_completion() {
    let (_dir, path) = temp_db("auto.db");
    let db = Database::open(&path).unwrap();
    seed_split_tables(&db);
    migrate_t_from_t_old(&db);

    db.enable_auto_migration(true);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !db.is_migrated() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert!(db.is_migrated());
    db.enable_auto_migration(false);
}
