//! Coordinator instructions to shards.
//!
//! An [`Operation`] is the coordinator's reply to one shard's report: the
//! DDL statements the shard must apply downstream, or a conflict notice
//! telling it to halt. The coordinator writes operations with
//! `done = false`; the shard acknowledges by rewriting the same key with
//! `done = true`.
//!
//! Coordinator writes are guarded against stale reports: the put is a
//! store transaction conditioned on the triggering report's mod-revision,
//! so an operation derived from an outdated report can never overwrite one
//! derived from a newer report. Shard acknowledgements pass `info_rev = 0`
//! and are conditioned only on the report still existing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use conflux_core::{InfoKey, KeyValue, MetaStore, OperationKey, Revision, TxnCond, TxnOp};

use crate::error::{DdlError, Result};

/// Conflict resolution stage of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStage {
    /// No conflict: the DDLs can be applied.
    #[default]
    None,
    /// The joiner rejected the shard's schema; the shard must halt.
    Detected,
    /// A previously detected conflict has been resolved.
    Resolved,
}

impl std::fmt::Display for ConflictStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Detected => "detected",
            Self::Resolved => "resolved",
        };
        write!(f, "{s}")
    }
}

/// The coordinator's current instruction to one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Replication task name.
    pub task: String,
    /// Upstream source identifier.
    pub source: String,
    /// Upstream schema name.
    pub up_schema: String,
    /// Upstream table name.
    pub up_table: String,
    /// DDL statements the shard must apply downstream. Empty when there is
    /// nothing to run (already converged, or a conflict was detected).
    pub ddls: Vec<String>,
    /// Conflict stage.
    pub conflict_stage: ConflictStage,
    /// `false` when written by the coordinator, `true` once the shard has
    /// acknowledged.
    pub done: bool,
    /// Store revision the operation was written at. Not serialized.
    #[serde(skip)]
    pub revision: Revision,
}

impl Operation {
    /// Creates a fresh (unacknowledged) instruction.
    #[must_use]
    pub fn new(
        task: impl Into<String>,
        source: impl Into<String>,
        up_schema: impl Into<String>,
        up_table: impl Into<String>,
        ddls: Vec<String>,
        conflict_stage: ConflictStage,
    ) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            up_schema: up_schema.into(),
            up_table: up_table.into(),
            ddls,
            conflict_stage,
            done: false,
            revision: 0,
        }
    }

    /// The store key of this instruction.
    #[must_use]
    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.task, &self.source, &self.up_schema, &self.up_table)
    }

    /// The key of the report this instruction answers.
    #[must_use]
    pub fn info_key(&self) -> InfoKey {
        InfoKey::new(&self.task, &self.source, &self.up_schema, &self.up_table)
    }
}

fn encode(op: &Operation) -> Result<Bytes> {
    let bytes = serde_json::to_vec(op).map_err(conflux_core::Error::serialization)?;
    Ok(Bytes::from(bytes))
}

/// Decodes an [`Operation`] from a store entry, stamping `revision`.
///
/// # Errors
///
/// Returns a decode error when the value is not a valid operation.
pub fn operation_from_kv(kv: &KeyValue) -> Result<Operation> {
    let mut op: Operation =
        serde_json::from_slice(&kv.value).map_err(|e| DdlError::decode(&kv.key, e))?;
    op.revision = kv.mod_revision;
    Ok(op)
}

/// Writes an instruction, conditioned on its report.
///
/// With `info_rev > 0` the write only lands while the report's
/// mod-revision still equals `info_rev` (the coordinator path). With
/// `info_rev == 0` the write only requires the report to exist (the
/// acknowledgement path). Returns the store revision and whether the
/// write landed.
///
/// # Errors
///
/// Returns an error when the store transaction fails.
pub async fn put_operation(
    store: &dyn MetaStore,
    op: &Operation,
    info_rev: Revision,
) -> Result<(Revision, bool)> {
    let info_key = op.info_key().as_ref().to_string();
    let cond = if info_rev > 0 {
        TxnCond::ModRevisionEq {
            key: info_key,
            revision: info_rev,
        }
    } else {
        TxnCond::KeyExists { key: info_key }
    };
    let result = store
        .txn(
            vec![cond],
            vec![TxnOp::Put {
                key: op.key().as_ref().to_string(),
                value: encode(op)?,
            }],
        )
        .await?;
    Ok((result.revision, result.succeeded))
}

/// Reads every instruction, skipping undecodable entries.
///
/// # Errors
///
/// Returns an error when the store read fails.
pub async fn get_all_operations(store: &dyn MetaStore) -> Result<(Vec<Operation>, Revision)> {
    let (entries, revision) = store.get_prefix(&OperationKey::prefix()).await?;
    let mut ops = Vec::with_capacity(entries.len());
    for kv in &entries {
        match operation_from_kv(kv) {
            Ok(op) => ops.push(op),
            Err(err) => {
                tracing::warn!(key = %kv.key, error = %err, "skipping corrupt operation entry");
            }
        }
    }
    Ok((ops, revision))
}
