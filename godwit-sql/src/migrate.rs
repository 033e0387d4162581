//! Statements driving the background migration stepper.
//!
//! One batch moves the highest-rowid source rows into the target and deletes
//! them from the source, both sides selecting the same rows because they run
//! inside one transaction. Descending rowid order keeps the remaining source
//! contiguous.

use sqlparser::ast::{Expr, FromTable, Select, SelectItem, SetExpr, Statement, TableWithJoins};

use godwit_result::{Error, Result};

use crate::parse::{self, plain_table_factor, quoted_ident};
use crate::tamper::TableMigration;

fn source_branch(select: &mut Select, migration: &TableMigration, projection: Vec<SelectItem>) {
    select.projection = projection;
    select.from = vec![TableWithJoins {
        relation: plain_table_factor(migration.source_name()),
        joins: Vec::new(),
    }];
    select.selection = migration.filter.clone();
}

fn column_projection(migration: &TableMigration) -> Vec<SelectItem> {
    migration
        .columns
        .iter()
        .map(|column| SelectItem::UnnamedExpr(Expr::Identifier(quoted_ident(column))))
        .collect()
}

/// `INSERT INTO target (cols) SELECT cols FROM source WHERE filter
/// ORDER BY rowid DESC LIMIT n`.
pub fn batch_insert_statement(migration: &TableMigration, limit: usize) -> Result<Statement> {
    let sql = format!("INSERT INTO placeholder SELECT * FROM placeholder WHERE 1 ORDER BY rowid DESC LIMIT {limit}");
    let mut statement = parse::parse_one(&sql)?;
    let Statement::Insert(insert) = &mut statement else {
        return Err(Error::internal("batch insert shell is not an insert"));
    };
    insert.table = sqlparser::ast::TableObject::TableName(migration.target_name());
    insert.columns = migration.columns.iter().map(|c| quoted_ident(c)).collect();
    let Some(query) = insert.source.as_deref_mut() else {
        return Err(Error::internal("batch insert shell has no source"));
    };
    if let SetExpr::Select(select) = &mut *query.body {
        source_branch(select, migration, column_projection(migration));
    }
    Ok(statement)
}

/// `DELETE FROM source WHERE rowid IN (SELECT rowid FROM source WHERE filter
/// ORDER BY rowid DESC LIMIT n)` — the correlated twin of the batch insert.
pub fn batch_delete_statement(migration: &TableMigration, limit: usize) -> Result<Statement> {
    let sql = format!(
        "DELETE FROM placeholder WHERE rowid IN (SELECT rowid FROM placeholder WHERE 1 ORDER BY rowid DESC LIMIT {limit})"
    );
    let mut statement = parse::parse_one(&sql)?;
    let Statement::Delete(delete) = &mut statement else {
        return Err(Error::internal("batch delete shell is not a delete"));
    };
    let tables = match &mut delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    if let Some(first) = tables.first_mut() {
        first.relation = plain_table_factor(migration.source_name());
    }
    if let Some(Expr::InSubquery { subquery, .. }) = &mut delete.selection {
        if let SetExpr::Select(select) = &mut *subquery.body {
            let rowid = vec![SelectItem::UnnamedExpr(Expr::Identifier(
                sqlparser::ast::Ident::new("rowid"),
            ))];
            source_branch(select, migration, rowid);
        }
    }
    Ok(statement)
}

/// `SELECT count(*) FROM source WHERE filter`.
pub fn count_remaining_statement(migration: &TableMigration) -> Result<Statement> {
    let mut statement = parse::parse_one("SELECT count(*) FROM placeholder WHERE 1")?;
    if let Statement::Query(query) = &mut statement {
        if let SetExpr::Select(select) = &mut *query.body {
            select.from = vec![TableWithJoins {
                relation: plain_table_factor(migration.source_name()),
                joins: Vec::new(),
            }];
            select.selection = migration.filter.clone();
        }
    }
    Ok(statement)
}

/// `DROP TABLE source`, issued once the source is fully drained.
pub fn drop_source_statement(migration: &TableMigration) -> Result<Statement> {
    let mut statement = parse::parse_one("DROP TABLE placeholder")?;
    if let Statement::Drop { names, .. } = &mut statement {
        if let Some(first) = names.first_mut() {
            *first = migration.source_name();
        }
    }
    Ok(statement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_expr;

    fn migration() -> TableMigration {
        TableMigration {
            target_table: "t".to_string(),
            source_table: "t_old".to_string(),
            source_schema: Some("legacy".to_string()),
            filter: Some(parse_expr("kind = 1").unwrap()),
            columns: vec!["id".to_string(), "v".to_string()],
            integer_primary_key: Some("id".to_string()),
        }
    }

    #[test]
    fn batch_insert_targets_both_tables_in_declared_order() {
        let sql = batch_insert_statement(&migration(), 10).unwrap().to_string();
        assert!(sql.contains("INSERT INTO \"t\" (\"id\", \"v\")"), "{sql}");
        assert!(sql.contains("\"legacy\".\"t_old\""), "{sql}");
        assert!(sql.contains("kind = 1"), "{sql}");
        assert!(sql.contains("ORDER BY rowid DESC LIMIT 10"), "{sql}");
    }

    #[test]
    fn batch_delete_correlates_on_rowid() {
        let sql = batch_delete_statement(&migration(), 7).unwrap().to_string();
        assert!(sql.starts_with("DELETE FROM \"legacy\".\"t_old\""), "{sql}");
        assert!(sql.contains("rowid IN (SELECT rowid FROM \"legacy\".\"t_old\""), "{sql}");
        assert!(sql.contains("LIMIT 7"), "{sql}");
    }

    #[test]
    fn count_and_drop_name_the_source() {
        let count = count_remaining_statement(&migration()).unwrap().to_string();
        assert!(count.contains("count(*)"), "{count}");
        assert!(count.contains("\"legacy\".\"t_old\""), "{count}");
        let drop = drop_source_statement(&migration()).unwrap().to_string();
        assert_eq!(drop, "DROP TABLE \"legacy\".\"t_old\"");
    }
}
