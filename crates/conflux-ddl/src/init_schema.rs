//! First-seen schemas for downstream targets.
//!
//! When a lock is created, the schema the first reporting shard started
//! from is persisted so that later restarts (and shards that have not
//! reported yet) can bootstrap from the same baseline. The write is
//! put-if-absent: only the first writer wins, concurrent lock creations
//! are harmless.

use bytes::Bytes;
use std::collections::BTreeMap;

use conflux_core::{InitSchemaKey, MetaStore, Revision, TxnCond, TxnOp};

use crate::error::{DdlError, Result};
use crate::schema::TableSchema;

/// Persists the baseline schema for a target unless one already exists.
/// Returns whether this call created it.
///
/// # Errors
///
/// Returns an error when the store transaction fails.
pub async fn put_init_schema_if_absent(
    store: &dyn MetaStore,
    task: &str,
    down_schema: &str,
    down_table: &str,
    schema: &TableSchema,
) -> Result<bool> {
    let key = InitSchemaKey::new(task, down_schema, down_table);
    let bytes = serde_json::to_vec(schema).map_err(conflux_core::Error::serialization)?;
    let result = store
        .txn(
            vec![TxnCond::KeyAbsent {
                key: key.as_ref().to_string(),
            }],
            vec![TxnOp::Put {
                key: key.as_ref().to_string(),
                value: Bytes::from(bytes),
            }],
        )
        .await?;
    Ok(result.succeeded)
}

/// Reads the baseline schema for a target, if any.
///
/// # Errors
///
/// Returns an error when the store read fails or the value is corrupt.
pub async fn get_init_schema(
    store: &dyn MetaStore,
    task: &str,
    down_schema: &str,
    down_table: &str,
) -> Result<Option<TableSchema>> {
    let key = InitSchemaKey::new(task, down_schema, down_table);
    match store.get(key.as_ref()).await? {
        None => Ok(None),
        Some(kv) => serde_json::from_slice(&kv.value)
            .map(Some)
            .map_err(|e| DdlError::decode(&kv.key, e)),
    }
}

/// Reads every baseline schema, keyed by `(task, downSchema, downTable)`.
/// Undecodable entries are skipped.
///
/// # Errors
///
/// Returns an error when the store read fails.
pub async fn get_all_init_schemas(
    store: &dyn MetaStore,
) -> Result<(BTreeMap<(String, String, String), TableSchema>, Revision)> {
    let (entries, revision) = store.get_prefix(&InitSchemaKey::prefix()).await?;
    let mut schemas = BTreeMap::new();
    for kv in &entries {
        let Some(target) = InitSchemaKey::parse(&kv.key) else {
            tracing::warn!(key = %kv.key, "skipping unparseable init-schema key");
            continue;
        };
        match serde_json::from_slice::<TableSchema>(&kv.value) {
            Ok(schema) => {
                schemas.insert(target, schema);
            }
            Err(err) => {
                tracing::warn!(key = %kv.key, error = %err, "skipping corrupt init-schema entry");
            }
        }
    }
    Ok((schemas, revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use conflux_core::MemoryMetaStore;

    fn schema() -> TableSchema {
        TableSchema::new("bar").with_column(ColumnDef::new("id", "INT").primary_key())
    }

    #[tokio::test]
    async fn first_writer_wins() {
        let store = MemoryMetaStore::new();
        let first = schema();
        let second = schema().with_column(ColumnDef::new("c1", "INT"));

        assert!(put_init_schema_if_absent(&store, "task", "foo", "bar", &first)
            .await
            .unwrap());
        assert!(
            !put_init_schema_if_absent(&store, "task", "foo", "bar", &second)
                .await
                .unwrap()
        );

        let stored = get_init_schema(&store, "task", "foo", "bar")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn get_all_groups_by_target() {
        let store = MemoryMetaStore::new();
        put_init_schema_if_absent(&store, "task", "foo", "bar", &schema())
            .await
            .unwrap();
        put_init_schema_if_absent(&store, "task", "foo", "rab", &schema())
            .await
            .unwrap();

        let (all, _) = get_all_init_schemas(&store).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key(&("task".into(), "foo".into(), "bar".into())));
        assert!(all.contains_key(&("task".into(), "foo".into(), "rab".into())));
    }

    #[tokio::test]
    async fn missing_target_reads_as_none() {
        let store = MemoryMetaStore::new();
        assert!(get_init_schema(&store, "task", "foo", "bar")
            .await
            .unwrap()
            .is_none());
    }
}
