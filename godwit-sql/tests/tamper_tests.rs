use std::sync::Arc;

use godwit_sql::ast::Statement;
use godwit_sql::{parse_expr, parse_one, tamper, Code, TableMigration, TamperContext};

fn context() -> TamperContext {
    let mut ctx = TamperContext::new();
    ctx.insert(Arc::new(TableMigration {
        target_table: "t".to_string(),
        source_table: "t_old".to_string(),
        source_schema: None,
        filter: Some(parse_expr("1 = 1").unwrap()),
        columns: vec!["id".to_string(), "v".to_string()],
        integer_primary_key: Some("id".to_string()),
    }));
    ctx
}

fn attached_context() -> TamperContext {
    let mut ctx = TamperContext::new();
    ctx.insert(Arc::new(TableMigration {
        target_table: "t".to_string(),
        source_table: "t_old".to_string(),
        source_schema: Some("legacy".to_string()),
        filter: None,
        columns: vec!["id".to_string(), "v".to_string()],
        integer_primary_key: None,
    }));
    ctx
}

fn rewrite(sql: &str, ctx: &TamperContext) -> Option<(Statement, Option<Statement>)> {
    let statement = parse_one(sql).unwrap();
    tamper(&statement, ctx)
        .unwrap()
        .map(|pair| (pair.primary, pair.shadow))
}

#[test]
fn select_rewrites_to_union_all() {
    let ctx = context();
    let (primary, shadow) = rewrite("SELECT id, v FROM t ORDER BY id", &ctx).unwrap();
    let sql = primary.to_string();
    assert!(sql.contains("UNION ALL"), "{sql}");
    assert!(sql.contains("\"t_old\""), "{sql}");
    assert!(sql.contains("1 = 1"), "{sql}");
    assert!(sql.contains("ORDER BY"), "{sql}");
    assert!(shadow.is_none());
}

#[test]
fn select_rewrite_is_idempotent() {
    let ctx = context();
    let (primary, _) = rewrite("SELECT id, v FROM t", &ctx).unwrap();
    // Rewriting the rewritten statement yields itself: no further change.
    assert!(tamper(&primary, &ctx).unwrap().is_none());
}

#[test]
fn select_rewrite_keeps_alias() {
    let ctx = context();
    let (primary, _) = rewrite("SELECT x.id FROM t AS x WHERE x.v = 'a'", &ctx).unwrap();
    let sql = primary.to_string();
    assert!(sql.contains("AS x"), "{sql}");
    assert!(sql.contains("UNION ALL"), "{sql}");
}

#[test]
fn join_and_subquery_occurrences_are_rewritten() {
    let ctx = context();
    let (primary, _) = rewrite(
        "SELECT a.x FROM a JOIN t ON a.id = t.id \
         WHERE a.id IN (SELECT id FROM t)",
        &ctx,
    )
    .unwrap();
    let sql = primary.to_string();
    assert_eq!(sql.matches("UNION ALL").count(), 2, "{sql}");
}

#[test]
fn attached_source_is_schema_qualified() {
    let ctx = attached_context();
    let (primary, _) = rewrite("SELECT id FROM t", &ctx).unwrap();
    let sql = primary.to_string();
    assert!(sql.contains("\"legacy\".\"t_old\""), "{sql}");
}

#[test]
fn unrelated_statements_pass_through() {
    let ctx = context();
    assert!(rewrite("SELECT * FROM other", &ctx).is_none());
    assert!(rewrite("INSERT INTO other (x) VALUES (1)", &ctx).is_none());
    assert!(rewrite("DELETE FROM other WHERE x = 1", &ctx).is_none());
}

#[test]
fn insert_with_caller_rowid_gets_shadow_delete() {
    let ctx = context();
    let (primary, shadow) = rewrite("INSERT INTO t (id, v) VALUES (?, ?)", &ctx).unwrap();
    assert_eq!(primary.to_string(), "INSERT INTO t (id, v) VALUES (?, ?)");
    let shadow = shadow.unwrap().to_string();
    assert!(shadow.contains("DELETE FROM"), "{shadow}");
    assert!(shadow.contains("\"t_old\""), "{shadow}");
    assert!(shadow.contains("last_insert_rowid()"), "{shadow}");
}

#[test]
fn insert_without_rowid_column_is_untouched() {
    let ctx = context();
    assert!(rewrite("INSERT INTO t (v) VALUES (?)", &ctx).is_none());
}

#[test]
fn insert_select_source_is_rewritten() {
    let ctx = context();
    let (primary, _) = rewrite("INSERT INTO other (id, v) SELECT id, v FROM t", &ctx).unwrap();
    assert!(primary.to_string().contains("UNION ALL"));
}

#[test]
fn partial_column_replace_is_rejected() {
    let ctx = context();
    let statement = parse_one("INSERT OR REPLACE INTO t (v) VALUES (?)").unwrap();
    let err = tamper(&statement, &ctx).unwrap_err();
    assert_eq!(err.code, Code::MigrationPrecondition);
}

#[test]
fn full_column_replace_keeps_the_shadow_delete() {
    let ctx = context();
    let (_, shadow) = rewrite("INSERT OR REPLACE INTO t (id, v) VALUES (?, ?)", &ctx).unwrap();
    assert!(shadow.unwrap().to_string().contains("last_insert_rowid()"));
}

#[test]
fn update_is_mirrored_onto_source() {
    let ctx = context();
    let (primary, shadow) = rewrite("UPDATE t SET v = ? WHERE id = ?", &ctx).unwrap();
    assert_eq!(primary.to_string(), "UPDATE t SET v = ? WHERE id = ?");
    let shadow = shadow.unwrap().to_string();
    assert!(shadow.contains("\"t_old\""), "{shadow}");
    assert!(shadow.contains("AND"), "{shadow}");
    assert!(shadow.contains("1 = 1"), "{shadow}");
}

#[test]
fn update_qualified_references_follow_the_source() {
    let ctx = context();
    let (_, shadow) = rewrite("UPDATE t SET v = ? WHERE t.id = ?", &ctx).unwrap();
    let shadow = shadow.unwrap().to_string();
    assert!(shadow.contains("\"t_old\".id"), "{shadow}");
}

#[test]
fn delete_is_mirrored_onto_source() {
    let ctx = context();
    let (primary, shadow) = rewrite("DELETE FROM t WHERE id = 1", &ctx).unwrap();
    assert_eq!(primary.to_string(), "DELETE FROM t WHERE id = 1");
    let shadow = shadow.unwrap().to_string();
    assert!(shadow.contains("\"t_old\""), "{shadow}");
    assert!(shadow.contains("id = 1"), "{shadow}");
    assert!(shadow.contains("1 = 1"), "{shadow}");
}

#[test]
fn delete_without_condition_mirrors_only_the_filter() {
    let ctx = context();
    let (_, shadow) = rewrite("DELETE FROM t", &ctx).unwrap();
    let shadow = shadow.unwrap().to_string();
    assert!(shadow.contains("WHERE 1 = 1"), "{shadow}");
}

#[test]
fn delete_with_limit_is_rejected() {
    let ctx = context();
    let statement = parse_one("DELETE FROM t WHERE id = 1 LIMIT 1").unwrap();
    let err = tamper(&statement, &ctx).unwrap_err();
    assert_eq!(err.code, Code::MigrationPrecondition);
}

#[test]
fn alter_on_migrating_table_is_rejected() {
    let ctx = context();
    let statement = parse_one("ALTER TABLE t RENAME TO t2").unwrap();
    let err = tamper(&statement, &ctx).unwrap_err();
    assert_eq!(err.code, Code::MigrationPrecondition);
}

#[test]
fn primary_and_shadow_target_disjoint_tables() {
    let ctx = context();
    for sql in [
        "INSERT INTO t (id, v) VALUES (1, 'a')",
        "UPDATE t SET v = 'b' WHERE id = 1",
        "DELETE FROM t WHERE id = 1",
    ] {
        let Some((primary, Some(shadow))) = rewrite(sql, &ctx) else {
            panic!("expected a shadow for {sql}");
        };
        let primary = primary.to_string();
        let shadow = shadow.to_string();
        assert!(!primary.contains("t_old"), "{primary}");
        assert!(shadow.contains("t_old"), "{shadow}");
    }
}
