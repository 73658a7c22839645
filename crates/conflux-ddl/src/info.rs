//! Shard DDL reports.
//!
//! An [`Info`] is a shard's report that it has observed a DDL and intends
//! to apply it: the statements, the schema before, and the schema after
//! each statement. The store stamps every report with a per-shard
//! monotonically increasing `version` (puts since the key was created) and
//! the global `revision` of the write; both drive staleness detection and
//! the replay order after a coordinator restart.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use conflux_core::{InfoKey, KeyValue, MetaStore, Revision};

use crate::error::{DdlError, Result};
use crate::schema::TableSchema;

/// A shard's report of an observed DDL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    /// Replication task name.
    pub task: String,
    /// Upstream source identifier.
    pub source: String,
    /// Upstream schema name.
    pub up_schema: String,
    /// Upstream table name.
    pub up_table: String,
    /// Downstream schema name.
    pub down_schema: String,
    /// Downstream table name.
    pub down_table: String,
    /// The observed DDL statements, in upstream order.
    pub ddls: Vec<String>,
    /// Schema before the first statement.
    pub pre_schema: TableSchema,
    /// Schema after each statement; parallel to `ddls`.
    pub post_schemas: Vec<TableSchema>,
    /// Store-assigned put counter for this shard's key. Not serialized.
    #[serde(skip)]
    pub version: i64,
    /// Store revision the report was written at. Not serialized.
    #[serde(skip)]
    pub revision: Revision,
}

impl Info {
    /// Creates a report. `version` and `revision` are assigned by the
    /// store on write.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        task: impl Into<String>,
        source: impl Into<String>,
        up_schema: impl Into<String>,
        up_table: impl Into<String>,
        down_schema: impl Into<String>,
        down_table: impl Into<String>,
        ddls: Vec<String>,
        pre_schema: TableSchema,
        post_schemas: Vec<TableSchema>,
    ) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            up_schema: up_schema.into(),
            up_table: up_table.into(),
            down_schema: down_schema.into(),
            down_table: down_table.into(),
            ddls,
            pre_schema,
            post_schemas,
            version: 0,
            revision: 0,
        }
    }

    /// The store key of this report.
    #[must_use]
    pub fn key(&self) -> InfoKey {
        InfoKey::new(&self.task, &self.source, &self.up_schema, &self.up_table)
    }
}

pub(crate) fn encode_info(info: &Info) -> Result<Bytes> {
    let bytes = serde_json::to_vec(info).map_err(conflux_core::Error::serialization)?;
    Ok(Bytes::from(bytes))
}

/// Decodes an [`Info`] from a store entry, stamping `version` and
/// `revision` from the entry's metadata.
///
/// # Errors
///
/// Returns a decode error when the value is not a valid report.
pub fn info_from_kv(kv: &KeyValue) -> Result<Info> {
    let mut info: Info =
        serde_json::from_slice(&kv.value).map_err(|e| DdlError::decode(&kv.key, e))?;
    info.version = kv.version;
    info.revision = kv.mod_revision;
    Ok(info)
}

/// Writes a report and returns the revision it landed at.
///
/// # Errors
///
/// Returns an error when the store write fails.
pub async fn put_info(store: &dyn MetaStore, info: &Info) -> Result<Revision> {
    let result = store.put(info.key().as_ref(), encode_info(info)?).await?;
    Ok(result.revision)
}

/// Removes a report.
///
/// # Errors
///
/// Returns an error when the store delete fails.
pub async fn delete_info(store: &dyn MetaStore, info: &Info) -> Result<Revision> {
    Ok(store.delete(info.key().as_ref()).await?)
}

/// Reads every report, skipping undecodable entries.
///
/// # Errors
///
/// Returns an error when the store read fails.
pub async fn get_all_info(store: &dyn MetaStore) -> Result<(Vec<Info>, Revision)> {
    let (entries, revision) = store.get_prefix(&InfoKey::prefix()).await?;
    let mut infos = Vec::with_capacity(entries.len());
    for kv in &entries {
        match info_from_kv(kv) {
            Ok(info) => infos.push(info),
            Err(err) => {
                tracing::warn!(key = %kv.key, error = %err, "skipping corrupt info entry");
            }
        }
    }
    Ok((infos, revision))
}

/// Orders a snapshot of reports for replay.
///
/// Reports are applied in ascending store revision, so a restarted
/// coordinator walks the same sequence a live one observed: shards whose
/// latest activity was earlier come first. Revisions are unique within one
/// store; the shard identity tie-break only exists to keep the order total
/// for merged snapshots.
#[must_use]
pub fn sort_infos(mut infos: Vec<Info>) -> Vec<Info> {
    infos.sort_by(|a, b| {
        a.revision.cmp(&b.revision).then_with(|| {
            (&a.source, &a.up_schema, &a.up_table).cmp(&(&b.source, &b.up_schema, &b.up_table))
        })
    });
    infos
}
