//! Migration statement rewriting.
//!
//! While a table's rows straddle the migration target and its source, every
//! user statement is run through [`tamper`] first. The function is pure: given
//! the same [`TamperContext`] snapshot it always produces the same
//! [`TamperedPair`], and re-tampering its own output is a no-op. It rewrites
//! syntax trees only; user SQL text is never concatenated.
//!
//! Rewrite rules by statement kind:
//!
//! - **SELECT** (including compounds, CTEs, and subqueries): every `FROM` or
//!   join occurrence of a migrating target becomes a parenthesized
//!   `UNION ALL` of the target and the filtered source, aliased to the
//!   original name. No shadow.
//! - **INSERT**: the primary is unchanged. When the statement can supply a
//!   caller-chosen rowid, a shadow `DELETE` removes the displaced source row.
//!   Partial-column REPLACE is rejected.
//! - **UPDATE / DELETE**: the primary is unchanged; a shadow mirrors the
//!   mutation onto the source with the migration row filter ANDed in.
//! - **ALTER TABLE** of a migrating target is rejected.
//! - Everything else passes through untouched.

use std::sync::{Arc, OnceLock};

use godwit_result::{Error, Result};
use rustc_hash::FxHashMap;
use sqlparser::ast::{
    Expr, FromTable, Ident, Insert, ObjectName, ObjectNamePart, Query, Select, SelectItem,
    SetExpr, SetOperator, SetQuantifier, SqliteOnConflict, Statement, TableAlias, TableFactor,
    TableObject,
};

use crate::parse::{self, and, blank_query, blank_select, plain_table_factor, quoted_ident};

/// Everything the tamperer needs to know about one migrating table.
///
/// Target and source column sets are structurally identical (same names and
/// declared types in the same order); that is a caller-guaranteed
/// precondition of the migration engine.
#[derive(Clone, Debug)]
pub struct TableMigration {
    /// The table user statements name; the post-migration home of the data.
    pub target_table: String,
    /// The legacy table still holding unmigrated rows.
    pub source_table: String,
    /// Schema the source lives in, when it comes from an attached database.
    pub source_schema: Option<String>,
    /// Row filter selecting which source rows belong to the target.
    pub filter: Option<Expr>,
    /// Declared column order of the target table.
    pub columns: Vec<String>,
    /// Column aliasing the rowid, when the table declares one.
    pub integer_primary_key: Option<String>,
}

impl TableMigration {
    /// Object name of the target table.
    pub fn target_name(&self) -> ObjectName {
        parse::object_name(&[&self.target_table])
    }

    /// Object name of the source table, schema-qualified when attached.
    pub fn source_name(&self) -> ObjectName {
        match &self.source_schema {
            Some(schema) => parse::object_name(&[schema, &self.source_table]),
            None => parse::object_name(&[&self.source_table]),
        }
    }
}

/// Immutable snapshot of the migration registry, keyed by target table.
#[derive(Clone, Default)]
pub struct TamperContext {
    tables: FxHashMap<String, Arc<TableMigration>>,
}

impl TamperContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, migration: Arc<TableMigration>) {
        self.tables
            .insert(migration.target_table.to_ascii_lowercase(), migration);
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn get(&self, target_table: &str) -> Option<&Arc<TableMigration>> {
        self.tables.get(&target_table.to_ascii_lowercase())
    }

    /// Resolve an object name against the snapshot. Only bare names and
    /// `main.`-qualified names can refer to a migrating target.
    fn lookup(&self, name: &ObjectName) -> Option<&Arc<TableMigration>> {
        let mut idents: Vec<&Ident> = Vec::with_capacity(name.0.len());
        for part in &name.0 {
            match part {
                ObjectNamePart::Identifier(ident) => idents.push(ident),
                _ => return None,
            }
        }
        let table = match idents.as_slice() {
            [only] => only,
            [schema, last] if schema.value.eq_ignore_ascii_case("main") => last,
            _ => return None,
        };
        self.tables.get(&table.value.to_ascii_lowercase())
    }
}

/// A rewritten statement plus the optional shadow that keeps the source
/// consistent. The primary always executes before the shadow, and the two
/// refer to disjoint underlying tables.
#[derive(Clone, Debug)]
pub struct TamperedPair {
    pub primary: Statement,
    pub shadow: Option<Statement>,
}

/// Rewrite `statement` for the migrations in `ctx`.
///
/// Returns `None` when the statement does not touch any migrating table and
/// can be executed as-is.
pub fn tamper(statement: &Statement, ctx: &TamperContext) -> Result<Option<TamperedPair>> {
    if ctx.is_empty() {
        return Ok(None);
    }
    match statement {
        Statement::Query(query) => {
            let mut rewritten = query.clone();
            if tamper_query(&mut rewritten, ctx)? {
                Ok(Some(TamperedPair {
                    primary: Statement::Query(rewritten),
                    shadow: None,
                }))
            } else {
                Ok(None)
            }
        }
        Statement::Insert(insert) => tamper_insert(insert, ctx),
        Statement::Update { .. } => tamper_update(statement, ctx),
        Statement::Delete(_) => tamper_delete(statement, ctx),
        Statement::AlterTable { name, .. } => {
            if let Some(migration) = ctx.lookup(name) {
                return Err(Error::migration_precondition(format!(
                    "cannot alter table '{}' while its migration is pending",
                    migration.target_table
                )));
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

// ============================================================================
// INSERT
// ============================================================================

fn tamper_insert(insert: &Insert, ctx: &TamperContext) -> Result<Option<TamperedPair>> {
    let mut rewritten = insert.clone();
    let mut changed = false;
    if let Some(source) = rewritten.source.as_deref_mut() {
        changed |= tamper_query(source, ctx)?;
    }

    let migration = match &rewritten.table {
        TableObject::TableName(name) => ctx.lookup(name).cloned(),
        _ => None,
    };
    let Some(migration) = migration else {
        if changed {
            return Ok(Some(TamperedPair {
                primary: Statement::Insert(rewritten),
                shadow: None,
            }));
        }
        return Ok(None);
    };

    let replace_semantics =
        rewritten.replace_into || matches!(rewritten.or, Some(SqliteOnConflict::Replace));
    let partial_columns =
        !rewritten.columns.is_empty() && rewritten.columns.len() < migration.columns.len();
    if replace_semantics && partial_columns {
        return Err(Error::migration_precondition(format!(
            "partial-column INSERT with REPLACE semantics into migrating table '{}'",
            migration.target_table
        )));
    }

    // The engine assigns fresh rowids above the target's maximum, so only a
    // caller-chosen rowid can collide with a row still in the source.
    let caller_rowid = rewritten.columns.is_empty()
        || migration
            .integer_primary_key
            .as_ref()
            .map(|pk| {
                rewritten
                    .columns
                    .iter()
                    .any(|column| column.value.eq_ignore_ascii_case(pk))
            })
            .unwrap_or(false);

    if !caller_rowid && !changed {
        return Ok(None);
    }
    let shadow = caller_rowid.then(|| rowid_delete_shadow(&migration));
    Ok(Some(TamperedPair {
        primary: Statement::Insert(rewritten),
        shadow,
    }))
}

fn rowid_delete_shadow(migration: &TableMigration) -> Statement {
    static TEMPLATE: OnceLock<Statement> = OnceLock::new();
    let mut shadow = TEMPLATE
        .get_or_init(|| {
            parse::template("DELETE FROM placeholder WHERE rowid = last_insert_rowid()")
        })
        .clone();
    retarget_delete(&mut shadow, migration.source_name());
    shadow
}

fn retarget_delete(statement: &mut Statement, name: ObjectName) {
    if let Statement::Delete(delete) = statement {
        let tables = match &mut delete.from {
            FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
        };
        if let Some(first) = tables.first_mut() {
            if let TableFactor::Table { name: slot, alias, .. } = &mut first.relation {
                *slot = name;
                *alias = None;
            }
        }
    }
}

// ============================================================================
// UPDATE / DELETE
// ============================================================================

fn tamper_update(statement: &Statement, ctx: &TamperContext) -> Result<Option<TamperedPair>> {
    let Statement::Update { table, .. } = statement else {
        return Ok(None);
    };
    let TableFactor::Table { name, .. } = &table.relation else {
        return Ok(None);
    };
    let Some(migration) = ctx.lookup(name).cloned() else {
        return Ok(None);
    };

    let mut shadow = statement.clone();
    if let Statement::Update {
        table,
        assignments,
        selection,
        ..
    } = &mut shadow
    {
        if let TableFactor::Table { name: slot, alias, .. } = &mut table.relation {
            *slot = migration.source_name();
            *alias = None;
        }
        for assignment in assignments.iter_mut() {
            requalify_expr(&mut assignment.value, &migration);
        }
        *selection = mirrored_selection(selection.take(), &migration);
    }

    Ok(Some(TamperedPair {
        primary: statement.clone(),
        shadow: Some(shadow),
    }))
}

fn tamper_delete(statement: &Statement, ctx: &TamperContext) -> Result<Option<TamperedPair>> {
    let Statement::Delete(delete) = statement else {
        return Ok(None);
    };
    let tables = match &delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    let Some(first) = tables.first() else {
        return Ok(None);
    };
    let TableFactor::Table { name, .. } = &first.relation else {
        return Ok(None);
    };
    let Some(migration) = ctx.lookup(name).cloned() else {
        return Ok(None);
    };

    if !delete.order_by.is_empty() || delete.limit.is_some() {
        return Err(Error::migration_precondition(format!(
            "DELETE with ORDER BY or LIMIT cannot be mirrored onto the source of '{}'",
            migration.target_table
        )));
    }

    let mut shadow = statement.clone();
    retarget_delete(&mut shadow, migration.source_name());
    if let Statement::Delete(shadow_delete) = &mut shadow {
        shadow_delete.selection = mirrored_selection(shadow_delete.selection.take(), &migration);
    }

    Ok(Some(TamperedPair {
        primary: statement.clone(),
        shadow: Some(shadow),
    }))
}

/// `cond AND filter` with target-qualified column references renamed to the
/// source table.
fn mirrored_selection(selection: Option<Expr>, migration: &TableMigration) -> Option<Expr> {
    match selection {
        Some(mut condition) => {
            requalify_expr(&mut condition, migration);
            match &migration.filter {
                Some(filter) => Some(and(condition, filter.clone())),
                None => Some(condition),
            }
        }
        None => migration.filter.clone(),
    }
}

/// Rename `target.column` references to the source table so a mirrored
/// condition resolves against the source. Column sets are structurally
/// identical, so only the qualifier changes.
fn requalify_expr(expr: &mut Expr, migration: &TableMigration) {
    match expr {
        Expr::CompoundIdentifier(idents) => {
            if idents.len() >= 2
                && idents[0]
                    .value
                    .eq_ignore_ascii_case(&migration.target_table)
            {
                let mut renamed = Vec::with_capacity(idents.len() + 1);
                if let Some(schema) = &migration.source_schema {
                    renamed.push(quoted_ident(schema));
                }
                renamed.push(quoted_ident(&migration.source_table));
                renamed.extend(idents[1..].iter().cloned());
                *idents = renamed;
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            requalify_expr(left, migration);
            requalify_expr(right, migration);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => requalify_expr(expr, migration),
        Expr::IsNull(expr) | Expr::IsNotNull(expr) => requalify_expr(expr, migration),
        Expr::InList { expr, list, .. } => {
            requalify_expr(expr, migration);
            for item in list {
                requalify_expr(item, migration);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            requalify_expr(expr, migration);
            requalify_expr(low, migration);
            requalify_expr(high, migration);
        }
        _ => {}
    }
}

// ============================================================================
// SELECT rewriting
// ============================================================================

fn tamper_query(query: &mut Query, ctx: &TamperContext) -> Result<bool> {
    let mut changed = false;
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            changed |= tamper_query(&mut cte.query, ctx)?;
        }
    }
    changed |= tamper_set_expr(&mut query.body, ctx)?;
    Ok(changed)
}

fn tamper_set_expr(body: &mut SetExpr, ctx: &TamperContext) -> Result<bool> {
    match body {
        SetExpr::Select(select) => tamper_select(select, ctx),
        SetExpr::Query(query) => tamper_query(query, ctx),
        SetExpr::SetOperation { left, right, .. } => {
            let mut changed = tamper_set_expr(left, ctx)?;
            changed |= tamper_set_expr(right, ctx)?;
            Ok(changed)
        }
        _ => Ok(false),
    }
}

fn tamper_select(select: &mut Select, ctx: &TamperContext) -> Result<bool> {
    let mut changed = false;
    for table in &mut select.from {
        changed |= tamper_factor(&mut table.relation, ctx)?;
        for join in &mut table.joins {
            changed |= tamper_factor(&mut join.relation, ctx)?;
        }
    }
    if let Some(selection) = &mut select.selection {
        changed |= tamper_expr(selection, ctx)?;
    }
    for item in &mut select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                changed |= tamper_expr(expr, ctx)?;
            }
            _ => {}
        }
    }
    Ok(changed)
}

fn tamper_factor(factor: &mut TableFactor, ctx: &TamperContext) -> Result<bool> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let Some(migration) = ctx.lookup(name).cloned() else {
                return Ok(false);
            };
            let alias = alias.take();
            *factor = union_factor(&migration, alias);
            Ok(true)
        }
        TableFactor::Derived { subquery, .. } => {
            // An already-rewritten factor is left alone; this is what makes
            // the tamperer idempotent on its own output.
            if is_union_rewrite(subquery, ctx) {
                Ok(false)
            } else {
                tamper_query(subquery, ctx)
            }
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            let mut changed = tamper_factor(&mut table_with_joins.relation, ctx)?;
            for join in &mut table_with_joins.joins {
                changed |= tamper_factor(&mut join.relation, ctx)?;
            }
            Ok(changed)
        }
        _ => Ok(false),
    }
}

fn tamper_expr(expr: &mut Expr, ctx: &TamperContext) -> Result<bool> {
    match expr {
        Expr::Subquery(subquery) => tamper_query(subquery, ctx),
        Expr::InSubquery { expr, subquery, .. } => {
            let mut changed = tamper_expr(expr, ctx)?;
            changed |= tamper_query(subquery, ctx)?;
            Ok(changed)
        }
        Expr::Exists { subquery, .. } => tamper_query(subquery, ctx),
        Expr::BinaryOp { left, right, .. } => {
            let mut changed = tamper_expr(left, ctx)?;
            changed |= tamper_expr(right, ctx)?;
            Ok(changed)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => tamper_expr(expr, ctx),
        Expr::IsNull(expr) | Expr::IsNotNull(expr) => tamper_expr(expr, ctx),
        Expr::InList { expr, list, .. } => {
            let mut changed = tamper_expr(expr, ctx)?;
            for item in list {
                changed |= tamper_expr(item, ctx)?;
            }
            Ok(changed)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            let mut changed = tamper_expr(expr, ctx)?;
            changed |= tamper_expr(low, ctx)?;
            changed |= tamper_expr(high, ctx)?;
            Ok(changed)
        }
        _ => Ok(false),
    }
}

/// `(SELECT cols FROM target UNION ALL SELECT cols FROM source WHERE filter)`
/// aliased to the original name so outer references keep resolving.
fn union_factor(migration: &TableMigration, alias: Option<TableAlias>) -> TableFactor {
    let left = branch_select(migration, migration.target_name(), None);
    let right = branch_select(migration, migration.source_name(), migration.filter.clone());
    let body = SetExpr::SetOperation {
        op: SetOperator::Union,
        set_quantifier: SetQuantifier::All,
        left: Box::new(SetExpr::Select(Box::new(left))),
        right: Box::new(SetExpr::Select(Box::new(right))),
    };
    let alias = alias.unwrap_or(TableAlias {
        name: quoted_ident(&migration.target_table),
        columns: Vec::new(),
    });
    TableFactor::Derived {
        lateral: false,
        subquery: Box::new(blank_query(body)),
        alias: Some(alias),
    }
}

fn branch_select(migration: &TableMigration, name: ObjectName, filter: Option<Expr>) -> Select {
    let mut select = blank_select();
    select.projection = migration
        .columns
        .iter()
        .map(|column| SelectItem::UnnamedExpr(Expr::Identifier(quoted_ident(column))))
        .collect();
    select.from = vec![sqlparser::ast::TableWithJoins {
        relation: plain_table_factor(name),
        joins: Vec::new(),
    }];
    select.selection = filter;
    select
}

fn is_union_rewrite(query: &Query, ctx: &TamperContext) -> bool {
    let SetExpr::SetOperation {
        op: SetOperator::Union,
        set_quantifier: SetQuantifier::All,
        left,
        right,
    } = &*query.body
    else {
        return false;
    };
    let (SetExpr::Select(left), SetExpr::Select(right)) = (&**left, &**right) else {
        return false;
    };
    let Some(target) = single_table(left) else {
        return false;
    };
    let Some(source) = single_table(right) else {
        return false;
    };
    let Some(migration) = ctx.lookup(target) else {
        return false;
    };
    object_names_equal(source, &migration.source_name())
}

fn single_table(select: &Select) -> Option<&ObjectName> {
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return None;
    }
    match &select.from[0].relation {
        TableFactor::Table { name, .. } => Some(name),
        _ => None,
    }
}

fn object_names_equal(a: &ObjectName, b: &ObjectName) -> bool {
    if a.0.len() != b.0.len() {
        return false;
    }
    a.0.iter().zip(b.0.iter()).all(|(x, y)| match (x, y) {
        (ObjectNamePart::Identifier(x), ObjectNamePart::Identifier(y)) => {
            x.value.eq_ignore_ascii_case(&y.value)
        }
        _ => false,
    })
}
