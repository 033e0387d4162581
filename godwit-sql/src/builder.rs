//! Typed chain-call builders.
//!
//! Builders accumulate clauses and emit a [`Statement`] value; the execution
//! engine consumes only the emitted statement. Identifiers are spliced into
//! template syntax trees, never concatenated into SQL text, so names need no
//! escaping at call sites.

use godwit_result::{Error, Result};
use sqlparser::ast::{
    Assignment, AssignmentTarget, Expr, FromTable, SelectItem, SetExpr, SqliteOnConflict,
    Statement, TableFactor, TableObject, TableWithJoins,
};

use crate::parse::{
    self, blank_query, blank_select, object_name, parse_all, parse_expr, plain_table_factor,
    quoted_ident,
};

/// Transaction kinds supported by `BEGIN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionKind {
    /// The `BEGIN` statement for this kind.
    pub fn begin_sql(self) -> &'static str {
        match self {
            TransactionKind::Deferred => "BEGIN DEFERRED",
            TransactionKind::Immediate => "BEGIN IMMEDIATE",
            TransactionKind::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Builder for `SELECT cols FROM [schema.]table [WHERE filter]`.
pub struct SelectBuilder {
    columns: Vec<String>,
    table: Option<String>,
    schema: Option<String>,
    filter: Option<Expr>,
}

impl SelectBuilder {
    /// Start a projection over the named columns. An empty list selects `*`.
    pub fn columns(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            table: None,
            schema: None,
            filter: None,
        }
    }

    pub fn from(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn in_schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn filter_sql(self, filter: &str) -> Result<Self> {
        let parsed = parse_expr(filter)?;
        Ok(self.filter(parsed))
    }

    pub fn build(self) -> Result<Statement> {
        let table = self
            .table
            .ok_or_else(|| Error::misuse("SELECT builder requires a table"))?;
        let name = match &self.schema {
            Some(schema) => object_name(&[schema, &table]),
            None => object_name(&[&table]),
        };
        let mut select = if self.columns.is_empty() {
            wildcard_select()
        } else {
            let mut select = blank_select();
            select.projection = self
                .columns
                .iter()
                .map(|column| SelectItem::UnnamedExpr(Expr::Identifier(quoted_ident(column))))
                .collect();
            select
        };
        select.from = vec![TableWithJoins {
            relation: plain_table_factor(name),
            joins: Vec::new(),
        }];
        select.selection = self.filter;
        Ok(Statement::Query(Box::new(blank_query(SetExpr::Select(
            Box::new(select),
        )))))
    }
}

/// Builder for `INSERT [OR REPLACE] INTO table (cols) VALUES (?, ...)`.
pub struct InsertBuilder {
    table: String,
    columns: Vec<String>,
    conflict: Option<SqliteOnConflict>,
}

impl InsertBuilder {
    pub fn into(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            conflict: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn columns_owned(mut self, columns: &[String]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn or_replace(mut self) -> Self {
        self.conflict = Some(SqliteOnConflict::Replace);
        self
    }

    pub fn or_ignore(mut self) -> Self {
        self.conflict = Some(SqliteOnConflict::Ignore);
        self
    }

    pub fn build(self) -> Result<Statement> {
        if self.columns.is_empty() {
            return Err(Error::misuse("INSERT builder requires at least one column"));
        }
        // The shell fixes the shape; only constant placeholders are rendered.
        let placeholders = vec!["?"; self.columns.len()].join(", ");
        let sql = format!("INSERT INTO placeholder VALUES ({placeholders})");
        let mut statements = parse_all(&sql)?;
        let mut statement = statements
            .pop()
            .ok_or_else(|| Error::internal("insert shell produced no statement"))?;
        if let Statement::Insert(insert) = &mut statement {
            insert.table = TableObject::TableName(object_name(&[&self.table]));
            insert.columns = self.columns.iter().map(|c| quoted_ident(c)).collect();
            insert.or = self.conflict;
        }
        Ok(statement)
    }
}

/// Builder for `UPDATE table SET col = ?, ... [WHERE filter]`.
pub struct UpdateBuilder {
    table: String,
    columns: Vec<String>,
    filter: Option<Expr>,
}

impl UpdateBuilder {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            filter: None,
        }
    }

    /// Columns assigned from positional placeholders, in order.
    pub fn set(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn filter_sql(self, filter: &str) -> Result<Self> {
        let parsed = parse_expr(filter)?;
        Ok(self.filter(parsed))
    }

    pub fn build(self) -> Result<Statement> {
        if self.columns.is_empty() {
            return Err(Error::misuse("UPDATE builder requires at least one assignment"));
        }
        let placeholder = parse_expr("?")?;
        let mut statement = parse::template("UPDATE placeholder SET placeholder = ?");
        if let Statement::Update {
            table,
            assignments,
            selection,
            ..
        } = &mut statement
        {
            if let TableFactor::Table { name, .. } = &mut table.relation {
                *name = object_name(&[&self.table]);
            }
            *assignments = self
                .columns
                .iter()
                .map(|column| Assignment {
                    target: AssignmentTarget::ColumnName(object_name(&[column])),
                    value: placeholder.clone(),
                })
                .collect();
            *selection = self.filter;
        }
        Ok(statement)
    }
}

/// Builder for `DELETE FROM table [WHERE filter]`.
pub struct DeleteBuilder {
    table: String,
    filter: Option<Expr>,
}

impl DeleteBuilder {
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filter: None,
        }
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn filter_sql(self, filter: &str) -> Result<Self> {
        let parsed = parse_expr(filter)?;
        Ok(self.filter(parsed))
    }

    pub fn build(self) -> Result<Statement> {
        let mut statement = parse::template("DELETE FROM placeholder");
        if let Statement::Delete(delete) = &mut statement {
            let tables = match &mut delete.from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            if let Some(first) = tables.first_mut() {
                first.relation = plain_table_factor(object_name(&[&self.table]));
            }
            delete.selection = self.filter;
        }
        Ok(statement)
    }
}

fn wildcard_select() -> sqlparser::ast::Select {
    match parse::template("SELECT * FROM placeholder") {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => *select,
            _ => unreachable!("wildcard template has a plain select body"),
        },
        _ => unreachable!("wildcard template is a query"),
    }
}
