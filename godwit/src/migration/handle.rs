//! The decorating handle: every statement is rewritten through the tamperer
//! before it reaches the engine.
//!
//! Fast path first: once every migration has completed, statements are
//! forwarded untouched with no locking beyond the handle's own. Otherwise
//! the registry's shared lock is held in read mode across the whole
//! statement, and a statement that produced a shadow runs both halves under
//! one savepoint: primary first, then shadow, commit on success, rollback
//! otherwise. Bindings are mirrored by parameter index, which is exactly
//! what binding a prefix of the primary's parameters achieves.

use rusqlite::types::Value;

use godwit_result::Result;
use godwit_sql::ast::Statement;
use godwit_sql::{referenced_tables, tamper};

use crate::handle::Handle;
use crate::migration::MigrationRegistry;

pub(crate) struct MigrationHandle<'a> {
    handle: &'a mut Handle,
    registry: &'a MigrationRegistry,
}

impl<'a> MigrationHandle<'a> {
    pub fn new(handle: &'a mut Handle, registry: &'a MigrationRegistry) -> Self {
        Self { handle, registry }
    }

    pub fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<usize> {
        if !self.registry.is_configured() || self.registry.all_completed() {
            return self.handle.execute_statement(statement, params);
        }
        self.resolve(statement)?;

        let registry = self.registry;
        let guard = registry.read();
        let pair = tamper(statement, &guard.context())?;
        match pair {
            None => self.handle.execute_statement(statement, params),
            Some(pair) => match pair.shadow {
                None => self.handle.execute_statement(&pair.primary, params),
                Some(shadow) => self.execute_mirrored(&pair.primary, &shadow, params),
            },
        }
    }

    pub fn query(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        if !self.registry.is_configured() || self.registry.all_completed() {
            return self.handle.query_rows_statement(statement, params);
        }
        self.resolve(statement)?;

        let registry = self.registry;
        let guard = registry.read();
        let pair = tamper(statement, &guard.context())?;
        match pair {
            None => self.handle.query_rows_statement(statement, params),
            Some(pair) => match pair.shadow {
                None => self.handle.query_rows_statement(&pair.primary, params),
                Some(shadow) => {
                    self.handle.begin_nested()?;
                    let result = self
                        .handle
                        .query_rows_statement(&pair.primary, params)
                        .and_then(|rows| {
                            self.handle.execute_statement(&shadow, params)?;
                            Ok(rows)
                        });
                    self.finish_nested(result)
                }
            },
        }
    }

    /// Bootstrap the registry, run referenced tables through the filter,
    /// and attach the source schema when any of them needs it.
    fn resolve(&mut self, statement: &Statement) -> Result<()> {
        self.registry.ensure_bootstrapped(self.handle)?;
        let names = referenced_tables(statement);
        self.registry.resolve_tables(self.handle, &names)?;
        self.registry.ensure_attached(self.handle, &names)
    }

    fn execute_mirrored(
        &mut self,
        primary: &Statement,
        shadow: &Statement,
        params: &[Value],
    ) -> Result<usize> {
        self.handle.begin_nested()?;
        let result = self
            .handle
            .execute_statement(primary, params)
            .and_then(|changes| {
                self.handle.execute_statement(shadow, params)?;
                Ok(changes)
            });
        self.finish_nested(result)
    }

    fn finish_nested<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.handle.commit_nested()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.handle.rollback_nested() {
                    tracing::warn!(%rollback_err, "savepoint rollback failed; handle discarded");
                }
                Err(err)
            }
        }
    }
}
