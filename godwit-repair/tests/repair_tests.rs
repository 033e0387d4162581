use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;

use godwit_repair::{generate_material, retrieve, write_rotating};

fn seed_database(db: &Path) {
    let conn = Connection::open(db).unwrap();
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, score REAL);
         CREATE INDEX people_name ON people (name);
         CREATE TABLE notes (body TEXT, attachment BLOB);",
    )
    .unwrap();
    let mut insert = conn
        .prepare("INSERT INTO people (id, name, score) VALUES (?1, ?2, ?3)")
        .unwrap();
    for i in 0..200i64 {
        insert
            .execute(rusqlite::params![i + 1, format!("person-{i}"), i as f64 / 2.0])
            .unwrap();
    }
    drop(insert);
    conn.execute(
        "INSERT INTO notes (body, attachment) VALUES ('hello', x'010203')",
        [],
    )
    .unwrap();
}

fn backup(db: &Path) {
    let conn = Connection::open(db).unwrap();
    let material = generate_material(&conn, db, None).unwrap();
    write_rotating(db, &material).unwrap();
}

fn row_count(db: &Path, table: &str) -> i64 {
    let conn = Connection::open(db).unwrap();
    conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

fn temp_db() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    (dir, db)
}

#[test]
fn backup_then_retrieve_reproduces_an_uncorrupted_database() {
    let (_dir, db) = temp_db();
    seed_database(&db);
    backup(&db);

    let mut ticks = 0;
    let fraction = retrieve(&db, &mut |_, _| ticks += 1).unwrap();
    assert!((fraction - 1.0).abs() < f64::EPSILON, "fraction = {fraction}");
    assert!(ticks > 0);

    assert_eq!(row_count(&db, "people"), 200);
    assert_eq!(row_count(&db, "notes"), 1);

    // Scalar values survive byte-identical; blobs are preserved opaquely.
    let conn = Connection::open(&db).unwrap();
    let (name, score): (String, f64) = conn
        .query_row(
            "SELECT name, score FROM people WHERE id = 42",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(name, "person-41");
    assert!((score - 20.5).abs() < f64::EPSILON);
    let blob: Vec<u8> = conn
        .query_row("SELECT attachment FROM notes", [], |row| row.get(0))
        .unwrap();
    assert_eq!(blob, vec![1, 2, 3]);

    // The index was recreated alongside the data.
    let indexes: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = 'people_name'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(indexes, 1);
}

#[test]
fn retrieve_with_material_survives_a_truncated_file() {
    let (_dir, db) = temp_db();
    seed_database(&db);
    // Fold the WAL so the main file holds everything, then back up.
    let conn = Connection::open(&db).unwrap();
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .unwrap();
    drop(conn);
    backup(&db);

    // Truncate the tail of the file; early pages stay readable.
    let len = fs::metadata(&db).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&db).unwrap();
    file.set_len(len * 3 / 4).unwrap();
    drop(file);

    let fraction = retrieve(&db, &mut |_, _| {}).unwrap();
    assert!(fraction > 0.0 && fraction <= 1.0, "fraction = {fraction}");
    assert!(row_count(&db, "people") > 0);
}

#[test]
fn retrieve_without_material_walks_from_the_schema_root() {
    let (_dir, db) = temp_db();
    seed_database(&db);
    // Fold the WAL; no material is written.
    let conn = Connection::open(&db).unwrap();
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .unwrap();
    drop(conn);

    let fraction = retrieve(&db, &mut |_, _| {}).unwrap();
    assert!((fraction - 1.0).abs() < f64::EPSILON, "fraction = {fraction}");
    assert_eq!(row_count(&db, "people"), 200);
    assert_eq!(row_count(&db, "notes"), 1);
}

#[test]
fn progress_is_monotonic_and_reaches_one() {
    let (_dir, db) = temp_db();
    seed_database(&db);
    backup(&db);

    let mut fractions = Vec::new();
    retrieve(&db, &mut |fraction, increment| {
        assert!(increment > 0.0);
        fractions.push(fraction);
    })
    .unwrap();
    assert!(!fractions.is_empty());
    assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!((fractions.last().unwrap() - 1.0).abs() < 1e-9);
}
