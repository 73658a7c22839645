//! The column lattice: schema comparison, joining, and DDL diffing.
//!
//! Schemas form a partial order under column-set inclusion: `a <= b` when
//! every column of `a` exists in `b` with an identical definition. The
//! **join** of a set of schemas is its least upper bound (the union of all
//! columns) and fails with [`SchemaConflict`] when two schemas disagree on
//! a column's definition (e.g. `c1 TEXT` vs `c1 DATETIME`), because no
//! common supertype exists.
//!
//! The lattice gives drop-column its retention semantics for free: the join
//! of every shard's last-known schema keeps a column until the last shard
//! has dropped it.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two shards disagree on a column's definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflicting definitions for column `{column}`: `{left}` vs `{right}`")]
pub struct SchemaConflict {
    /// The column both sides define differently.
    pub column: String,
    /// The left-hand definition.
    pub left: String,
    /// The right-hand definition.
    pub right: String,
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// SQL type as reported by the upstream parser (e.g. `INT`, `TEXT`).
    pub type_name: String,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

impl ColumnDef {
    /// Creates a nullable, non-key column.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key: false,
        }
    }

    /// Marks the column as primary key (and therefore NOT NULL).
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Marks the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn definition(&self) -> String {
        let mut def = format!("{} {}", self.name, self.type_name);
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }
}

/// A table schema: the unit the coordinator joins and diffs.
///
/// Ordering of `columns` is the upstream declaration order; joins preserve
/// the left operand's order and append new columns from the right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name the DDL statements are rendered against.
    pub table: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Creates an empty schema for the given table.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    /// Appends a column (builder style).
    #[must_use]
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns whether both schemas have the same columns, ignoring the
    /// table name. Shards of one target carry distinct upstream table
    /// names, so all lattice predicates compare columns only.
    #[must_use]
    pub fn eq_columns(&self, other: &TableSchema) -> bool {
        self.columns == other.columns
    }

    /// Compares two schemas in the column lattice.
    ///
    /// Returns `Some(Equal)` for identical column sets, `Some(Less)` /
    /// `Some(Greater)` for strict subset/superset with matching shared
    /// definitions, and `None` when the schemas are incomparable (each has
    /// columns the other lacks, or a shared column differs).
    #[must_use]
    pub fn compare(&self, other: &TableSchema) -> Option<Ordering> {
        let mut self_covers = true;
        let mut other_covers = true;

        for col in &self.columns {
            match other.column(&col.name) {
                Some(found) if found == col => {}
                Some(_) => return None,
                None => other_covers = false,
            }
        }
        for col in &other.columns {
            match self.column(&col.name) {
                Some(found) if found == col => {}
                Some(_) => return None,
                None => self_covers = false,
            }
        }

        match (self_covers, other_covers) {
            (true, true) => Some(Ordering::Equal),
            // `other` has every column of `self` plus more.
            (false, true) => Some(Ordering::Less),
            // `self` has every column of `other` plus more.
            (true, false) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    /// Joins two schemas into their least upper bound.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaConflict`] when a shared column is defined
    /// differently on each side.
    pub fn join(&self, other: &TableSchema) -> Result<TableSchema, SchemaConflict> {
        let mut columns = self.columns.clone();
        for col in &other.columns {
            match self.column(&col.name) {
                None => columns.push(col.clone()),
                Some(existing) if existing == col => {}
                Some(existing) => {
                    return Err(SchemaConflict {
                        column: col.name.clone(),
                        left: existing.definition(),
                        right: col.definition(),
                    })
                }
            }
        }
        Ok(TableSchema {
            table: self.table.clone(),
            columns,
        })
    }

    /// Derives the ordered DDL statements turning `self` into `to`.
    ///
    /// The output is deterministic: added and modified columns follow the
    /// target's declaration order, dropped columns follow the source's.
    #[must_use]
    pub fn diff(&self, to: &TableSchema) -> Vec<String> {
        let mut ddls = Vec::new();
        for col in &to.columns {
            match self.column(&col.name) {
                None => ddls.push(format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    to.table, col.name, col.type_name
                )),
                Some(existing) if existing != col => ddls.push(format!(
                    "ALTER TABLE {} MODIFY COLUMN {} {}",
                    to.table, col.name, col.type_name
                )),
                Some(_) => {}
            }
        }
        for col in &self.columns {
            if to.column(&col.name).is_none() {
                ddls.push(format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    to.table, col.name
                ));
            }
        }
        ddls
    }
}

/// Joins every schema in the set, or reports the first conflict.
///
/// Returns `None` for an empty input.
///
/// # Errors
///
/// Returns [`SchemaConflict`] when any pair of inputs disagrees on a
/// column's definition.
pub fn join_all<'a, I>(schemas: I) -> Result<Option<TableSchema>, SchemaConflict>
where
    I: IntoIterator<Item = &'a TableSchema>,
{
    let mut joined: Option<TableSchema> = None;
    for schema in schemas {
        joined = Some(match joined {
            None => schema.clone(),
            Some(acc) => acc.join(schema)?,
        });
    }
    Ok(joined)
}
