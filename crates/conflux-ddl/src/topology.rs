//! Upstream table declarations and their downstream routing.
//!
//! A [`SourceTables`] record declares, per `(task, source)`, which upstream
//! tables participate in replication and which downstream table each one
//! feeds. Agents write the record when a task starts or a table is created,
//! and rewrite it when tables are dropped.
//!
//! Routing changes that must be observed together with a shard report are
//! written through the atomic combinators [`put_source_tables_info`] and
//! [`put_source_tables_delete_info`], so a watcher can never see the
//! registry and the report out of step.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use conflux_core::{InfoKey, KeyValue, MetaStore, Revision, SourceTablesKey, TxnOp};

use crate::error::{DdlError, Result};
use crate::info::Info;

/// The upstream tables of one `(task, source)` and their downstream
/// mapping, keyed `downSchema → downTable → upSchema → {upTable}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTables {
    /// Replication task name.
    pub task: String,
    /// Upstream source identifier.
    pub source: String,
    /// Routing map.
    pub targets: BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeSet<String>>>>,
}

impl SourceTables {
    /// Creates an empty declaration.
    #[must_use]
    pub fn new(task: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            targets: BTreeMap::new(),
        }
    }

    /// Declares that `upSchema.upTable` feeds `downSchema.downTable`.
    /// Returns whether the entry was newly added.
    pub fn add_table(
        &mut self,
        up_schema: &str,
        up_table: &str,
        down_schema: &str,
        down_table: &str,
    ) -> bool {
        self.targets
            .entry(down_schema.to_string())
            .or_default()
            .entry(down_table.to_string())
            .or_default()
            .entry(up_schema.to_string())
            .or_default()
            .insert(up_table.to_string())
    }

    /// Removes a declaration. Returns whether the entry existed.
    pub fn remove_table(
        &mut self,
        up_schema: &str,
        up_table: &str,
        down_schema: &str,
        down_table: &str,
    ) -> bool {
        let Some(down_tables) = self.targets.get_mut(down_schema) else {
            return false;
        };
        let Some(up_schemas) = down_tables.get_mut(down_table) else {
            return false;
        };
        let Some(up_tables) = up_schemas.get_mut(up_schema) else {
            return false;
        };
        let removed = up_tables.remove(up_table);
        if up_tables.is_empty() {
            up_schemas.remove(up_schema);
        }
        if up_schemas.is_empty() {
            down_tables.remove(down_table);
        }
        if down_tables.is_empty() {
            self.targets.remove(down_schema);
        }
        removed
    }

    /// Returns whether the declaration contains one routing entry.
    #[must_use]
    pub fn contains_table(
        &self,
        down_schema: &str,
        down_table: &str,
        up_schema: &str,
        up_table: &str,
    ) -> bool {
        self.targets
            .get(down_schema)
            .and_then(|t| t.get(down_table))
            .and_then(|t| t.get(up_schema))
            .is_some_and(|tables| tables.contains(up_table))
    }

    /// Projects the declaration onto one downstream target.
    #[must_use]
    pub fn target_table(&self, down_schema: &str, down_table: &str) -> TargetTable {
        let up_tables = self
            .targets
            .get(down_schema)
            .and_then(|t| t.get(down_table))
            .cloned()
            .unwrap_or_default();
        TargetTable {
            task: self.task.clone(),
            source: self.source.clone(),
            down_schema: down_schema.to_string(),
            down_table: down_table.to_string(),
            up_tables,
        }
    }

    /// Flattens the declaration into
    /// `(downSchema, downTable, upSchema, upTable)` tuples.
    #[must_use]
    pub fn table_entries(&self) -> Vec<(String, String, String, String)> {
        let mut entries = Vec::new();
        for (down_schema, down_tables) in &self.targets {
            for (down_table, up_schemas) in down_tables {
                for (up_schema, up_tables) in up_schemas {
                    for up_table in up_tables {
                        entries.push((
                            down_schema.clone(),
                            down_table.clone(),
                            up_schema.clone(),
                            up_table.clone(),
                        ));
                    }
                }
            }
        }
        entries
    }
}

/// The upstream tables of one source that feed one downstream table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTable {
    /// Replication task name.
    pub task: String,
    /// Upstream source identifier.
    pub source: String,
    /// Downstream schema.
    pub down_schema: String,
    /// Downstream table.
    pub down_table: String,
    /// Participating upstream tables, `upSchema → {upTable}`.
    pub up_tables: BTreeMap<String, BTreeSet<String>>,
}

impl TargetTable {
    /// Returns whether no upstream table participates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.up_tables.values().all(BTreeSet::is_empty)
    }

    /// Returns whether the given upstream table participates.
    #[must_use]
    pub fn contains(&self, up_schema: &str, up_table: &str) -> bool {
        self.up_tables
            .get(up_schema)
            .is_some_and(|tables| tables.contains(up_table))
    }
}

// ============================================================================
// Store helpers
// ============================================================================

fn encode(st: &SourceTables) -> Result<Bytes> {
    let bytes = serde_json::to_vec(st).map_err(conflux_core::Error::serialization)?;
    Ok(Bytes::from(bytes))
}

/// Decodes a [`SourceTables`] record from a store entry.
///
/// # Errors
///
/// Returns a decode error when the value is not a valid record.
pub fn source_tables_from_kv(kv: &KeyValue) -> Result<SourceTables> {
    serde_json::from_slice(&kv.value).map_err(|e| DdlError::decode(&kv.key, e))
}

/// Writes a [`SourceTables`] record.
///
/// # Errors
///
/// Returns an error when the store write fails.
pub async fn put_source_tables(store: &dyn MetaStore, st: &SourceTables) -> Result<Revision> {
    let key = SourceTablesKey::new(&st.task, &st.source);
    let result = store.put(key.as_ref(), encode(st)?).await?;
    Ok(result.revision)
}

/// Removes a [`SourceTables`] record.
///
/// # Errors
///
/// Returns an error when the store delete fails.
pub async fn delete_source_tables(store: &dyn MetaStore, st: &SourceTables) -> Result<Revision> {
    let key = SourceTablesKey::new(&st.task, &st.source);
    Ok(store.delete(key.as_ref()).await?)
}

/// Reads every [`SourceTables`] record, skipping undecodable entries.
///
/// # Errors
///
/// Returns an error when the store read fails.
pub async fn get_all_source_tables(
    store: &dyn MetaStore,
) -> Result<(Vec<SourceTables>, Revision)> {
    let (entries, revision) = store.get_prefix(&SourceTablesKey::prefix()).await?;
    let mut records = Vec::with_capacity(entries.len());
    for kv in &entries {
        match source_tables_from_kv(kv) {
            Ok(st) => records.push(st),
            Err(err) => tracing::warn!(key = %kv.key, error = %err, "skipping corrupt source-tables entry"),
        }
    }
    Ok((records, revision))
}

/// Atomically writes a [`SourceTables`] record together with a shard
/// report, so the routing change and the report land at one revision.
///
/// # Errors
///
/// Returns an error when the store transaction fails.
pub async fn put_source_tables_info(
    store: &dyn MetaStore,
    st: &SourceTables,
    info: &Info,
) -> Result<Revision> {
    let st_key = SourceTablesKey::new(&st.task, &st.source);
    let info_key = InfoKey::new(&info.task, &info.source, &info.up_schema, &info.up_table);
    let result = store
        .txn(
            vec![],
            vec![
                TxnOp::Put {
                    key: st_key.as_ref().to_string(),
                    value: encode(st)?,
                },
                TxnOp::Put {
                    key: info_key.as_ref().to_string(),
                    value: crate::info::encode_info(info)?,
                },
            ],
        )
        .await?;
    Ok(result.revision)
}

/// Atomically writes a [`SourceTables`] record and deletes the given
/// shard's report (the `DROP TABLE` path).
///
/// # Errors
///
/// Returns an error when the store transaction fails.
pub async fn put_source_tables_delete_info(
    store: &dyn MetaStore,
    st: &SourceTables,
    info: &Info,
) -> Result<Revision> {
    let st_key = SourceTablesKey::new(&st.task, &st.source);
    let info_key = InfoKey::new(&info.task, &info.source, &info.up_schema, &info.up_table);
    let result = store
        .txn(
            vec![],
            vec![
                TxnOp::Put {
                    key: st_key.as_ref().to_string(),
                    value: encode(st)?,
                },
                TxnOp::Delete {
                    key: info_key.as_ref().to_string(),
                },
            ],
        )
        .await?;
    Ok(result.revision)
}
