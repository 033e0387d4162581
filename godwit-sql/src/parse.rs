//! Parsing helpers and structural accessors over the SQLite dialect.
//!
//! Fixed AST shells (an empty `SELECT`, a bare table factor) are derived from
//! constant templates parsed once per process. Synthesized nodes never pass
//! through SQL text again; identifiers are spliced into the tree directly.

use std::sync::OnceLock;

use godwit_result::{Error, Result};
use sqlparser::ast::{
    Expr, FromTable, Ident, ObjectName, ObjectNamePart, Query, Select, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

/// Parse a string of one or more statements.
pub fn parse_all(sql: &str) -> Result<Vec<Statement>> {
    Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|err| Error::from(err).with_sql(sql))
}

/// Parse exactly one statement.
pub fn parse_one(sql: &str) -> Result<Statement> {
    let mut statements = parse_all(sql)?;
    if statements.len() != 1 {
        return Err(Error::misuse(format!(
            "expected exactly one statement, found {}",
            statements.len()
        ))
        .with_sql(sql));
    }
    Ok(statements.remove(0))
}

/// Parse a single scalar expression (e.g. a migration row filter).
pub fn parse_expr(sql: &str) -> Result<Expr> {
    let mut parser = Parser::new(&SQLiteDialect {})
        .try_with_sql(sql)
        .map_err(|err| Error::from(err).with_sql(sql))?;
    parser
        .parse_expr()
        .map_err(|err| Error::from(err).with_sql(sql))
}

/// A double-quoted identifier. Every identifier godwit synthesizes is quoted
/// so table and column names never need escaping rules at splice sites.
pub fn quoted_ident(name: &str) -> Ident {
    Ident::with_quote('"', name)
}

/// Render an identifier double-quoted for the rare call sites (PRAGMAs)
/// whose arguments cannot be expressed as syntax trees.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// An object name from raw (unquoted) parts.
pub fn object_name(parts: &[&str]) -> ObjectName {
    ObjectName(
        parts
            .iter()
            .map(|part| ObjectNamePart::Identifier(quoted_ident(part)))
            .collect(),
    )
}

/// The raw identifier values of an object name, joined with `.`.
pub fn object_name_string(name: &ObjectName) -> String {
    let mut parts = Vec::with_capacity(name.0.len());
    for part in &name.0 {
        match part {
            ObjectNamePart::Identifier(ident) => parts.push(ident.value.clone()),
            other => parts.push(other.to_string()),
        }
    }
    parts.join(".")
}

/// True when `name` refers to `table` in the primary schema: either the bare
/// table name or `main.<table>`, compared case-insensitively.
pub fn names_table(name: &ObjectName, table: &str) -> bool {
    let idents: Vec<&Ident> = name
        .0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident),
            _ => None,
        })
        .collect();
    if idents.len() != name.0.len() {
        return false;
    }
    match idents.as_slice() {
        [only] => only.value.eq_ignore_ascii_case(table),
        [schema, last] => {
            schema.value.eq_ignore_ascii_case("main") && last.value.eq_ignore_ascii_case(table)
        }
        _ => false,
    }
}

pub(crate) fn template(sql: &'static str) -> Statement {
    // Templates are compile-time constants; failing to parse one is a bug.
    let mut statements =
        Parser::parse_sql(&SQLiteDialect {}, sql).expect("constant template must parse");
    statements.pop().expect("constant template must not be empty")
}

fn select_shell() -> &'static Statement {
    static SHELL: OnceLock<Statement> = OnceLock::new();
    SHELL.get_or_init(|| template("SELECT 1"))
}

fn factor_shell() -> &'static Statement {
    static SHELL: OnceLock<Statement> = OnceLock::new();
    SHELL.get_or_init(|| template("SELECT 1 FROM placeholder"))
}

/// An empty `SELECT` shell: no FROM, no WHERE, projection `1` to overwrite.
pub(crate) fn blank_select() -> Select {
    match select_shell().clone() {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => *select,
            _ => unreachable!("select template has a plain select body"),
        },
        _ => unreachable!("select template is a query"),
    }
}

/// A query shell with every optional clause absent and the given body.
pub(crate) fn blank_query(body: SetExpr) -> Query {
    match select_shell().clone() {
        Statement::Query(mut query) => {
            *query.body = body;
            *query
        }
        _ => unreachable!("select template is a query"),
    }
}

/// A plain table factor for `name`, with no alias, hints, or arguments.
pub(crate) fn plain_table_factor(name: ObjectName) -> TableFactor {
    let mut factor = match factor_shell().clone() {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => select
                .from
                .into_iter()
                .next()
                .map(|table| table.relation)
                .expect("factor template has one table"),
            _ => unreachable!("factor template has a plain select body"),
        },
        _ => unreachable!("factor template is a query"),
    };
    if let TableFactor::Table {
        name: slot, alias, ..
    } = &mut factor
    {
        *slot = name;
        *alias = None;
    }
    factor
}

/// `left AND right`, with both sides parenthesized.
pub(crate) fn and(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(Expr::Nested(Box::new(left))),
        op: sqlparser::ast::BinaryOperator::And,
        right: Box::new(Expr::Nested(Box::new(right))),
    }
}

/// Collect the tables a statement references, as lowercase unqualified names.
///
/// This powers lazy migration resolution: before tampering, every referenced
/// name is run through the user's table filter once. The walk mirrors the
/// tamperer's own traversal, so a table the tamperer could rewrite is always
/// resolved first.
pub fn referenced_tables(statement: &Statement) -> Vec<String> {
    let mut out = Vec::new();
    match statement {
        Statement::Query(query) => collect_query(query, &mut out),
        Statement::Insert(insert) => {
            if let TableObject::TableName(name) = &insert.table {
                push_name(name, &mut out);
            }
            if let Some(source) = &insert.source {
                collect_query(source, &mut out);
            }
        }
        Statement::Update { table, selection, .. } => {
            collect_factor(&table.relation, &mut out);
            if let Some(expr) = selection {
                collect_expr(expr, &mut out);
            }
        }
        Statement::Delete(delete) => {
            let tables = match &delete.from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            for table in tables {
                collect_factor(&table.relation, &mut out);
            }
            if let Some(expr) = &delete.selection {
                collect_expr(expr, &mut out);
            }
        }
        Statement::AlterTable { name, .. } => push_name(name, &mut out),
        Statement::Drop { names, .. } => {
            for name in names {
                push_name(name, &mut out);
            }
        }
        _ => {}
    }
    out.sort();
    out.dedup();
    out
}

fn push_name(name: &ObjectName, out: &mut Vec<String>) {
    if let Some(ObjectNamePart::Identifier(ident)) = name.0.last() {
        out.push(ident.value.to_ascii_lowercase());
    }
}

fn collect_query(query: &Query, out: &mut Vec<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, out);
        }
    }
    collect_set_expr(&query.body, out);
}

fn collect_set_expr(body: &SetExpr, out: &mut Vec<String>) {
    match body {
        SetExpr::Select(select) => collect_select(select, out),
        SetExpr::Query(query) => collect_query(query, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, out);
            collect_set_expr(right, out);
        }
        _ => {}
    }
}

fn collect_select(select: &Select, out: &mut Vec<String>) {
    for table in &select.from {
        collect_table_with_joins(table, out);
    }
    if let Some(expr) = &select.selection {
        collect_expr(expr, out);
    }
}

fn collect_table_with_joins(table: &TableWithJoins, out: &mut Vec<String>) {
    collect_factor(&table.relation, out);
    for join in &table.joins {
        collect_factor(&join.relation, out);
    }
}

fn collect_factor(factor: &TableFactor, out: &mut Vec<String>) {
    match factor {
        TableFactor::Table { name, .. } => push_name(name, out),
        TableFactor::Derived { subquery, .. } => collect_query(subquery, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, out),
        _ => {}
    }
}

fn collect_expr(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            collect_expr(left, out);
            collect_expr(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => collect_expr(expr, out),
        Expr::IsNull(expr) | Expr::IsNotNull(expr) => collect_expr(expr, out),
        Expr::InList { expr, list, .. } => {
            collect_expr(expr, out);
            for item in list {
                collect_expr(item, out);
            }
        }
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr(expr, out);
            collect_query(subquery, out);
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_expr(expr, out);
            collect_expr(low, out);
            collect_expr(high, out);
        }
        Expr::Exists { subquery, .. } => collect_query(subquery, out),
        Expr::Subquery(subquery) => collect_query(subquery, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_one_rejects_multiple() {
        assert!(parse_one("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn names_table_handles_main_schema() {
        let bare = object_name(&["logs"]);
        let qualified = object_name(&["main", "logs"]);
        let foreign = object_name(&["aux", "logs"]);
        assert!(names_table(&bare, "LOGS"));
        assert!(names_table(&qualified, "logs"));
        assert!(!names_table(&foreign, "logs"));
    }

    #[test]
    fn referenced_tables_sees_joins_and_subqueries() {
        let stmt = parse_one(
            "SELECT a.x FROM a JOIN b ON a.id = b.id \
             WHERE a.id IN (SELECT id FROM c)",
        )
        .unwrap();
        assert_eq!(referenced_tables(&stmt), vec!["a", "b", "c"]);
    }

    #[test]
    fn referenced_tables_sees_insert_select_source() {
        let stmt = parse_one("INSERT INTO t (x) SELECT x FROM old_t").unwrap();
        assert_eq!(referenced_tables(&stmt), vec!["old_t", "t"]);
    }
}
