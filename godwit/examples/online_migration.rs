//! Walkthrough of online table migration: reads and writes behave as if the
//! legacy rows had already been copied, while the stepper drains them in the
//! background.

use godwit::{Database, MigrationSource, Value};

fn main() -> godwit::Result<()> {
    let dir = std::env::temp_dir().join("godwit-migration-demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("demo.db");
    let _ = std::fs::remove_file(&path);

    let db = Database::open(&path)?;
    db.execute_sql(
        "CREATE TABLE messages (id INTEGER PRIMARY KEY, body TEXT);
         CREATE TABLE messages_legacy (id INTEGER PRIMARY KEY, body TEXT);
         INSERT INTO messages_legacy (id, body) VALUES
             (1, 'from the old world'),
             (2, 'still in the legacy table');",
    )?;

    db.add_migration(None, None, |table| {
        (table == "messages").then(|| MigrationSource {
            source_table: "messages_legacy".to_string(),
            filter: None,
        })
    });
    db.set_notification_when_migrated(Some(std::sync::Arc::new(|info| match info {
        Some(info) => println!("table migrated: {} <- {}", info.table, info.source_table),
        None => println!("database fully migrated"),
    })));

    // Reads see both tables as one.
    for row in db.query_sql("SELECT id, body FROM messages ORDER BY id")? {
        if let [Value::Integer(id), Value::Text(body)] = row.as_slice() {
            println!("message {id}: {body}");
        }
    }

    // Writes are mirrored so the union stays consistent.
    db.execute_sql("DELETE FROM messages WHERE id = 1")?;

    // Drain the source in bounded steps.
    while !db.step_migration()? {}
    assert!(db.is_migrated());
    assert!(!db.table_exists("messages_legacy")?);

    let rows = db.query_sql("SELECT count(*) FROM messages")?;
    println!("rows after migration: {rows:?}");
    Ok(())
}
