//! Keyspace administration helpers.

use conflux_core::{InfoKey, InitSchemaKey, MetaStore, OperationKey, SourceTablesKey, TxnOp};

use crate::error::Result;

/// Deletes every coordination key of one task in a single transaction:
/// source-tables, infos, operations, and init schemas. An empty task
/// clears the whole keyspace (used by test suites sharing one store).
///
/// # Errors
///
/// Returns an error when the store transaction fails.
pub async fn clear_task(store: &dyn MetaStore, task: &str) -> Result<()> {
    let prefixes = if task.is_empty() {
        vec![
            SourceTablesKey::prefix(),
            InfoKey::prefix(),
            OperationKey::prefix(),
            InitSchemaKey::prefix(),
        ]
    } else {
        vec![
            SourceTablesKey::task_prefix(task),
            InfoKey::task_prefix(task),
            OperationKey::task_prefix(task),
            InitSchemaKey::task_prefix(task),
        ]
    };
    let ops = prefixes
        .into_iter()
        .map(|prefix| TxnOp::DeletePrefix { prefix })
        .collect();
    store.txn(vec![], ops).await?;
    Ok(())
}
