//! The `ShowLocks` query surface.
//!
//! Read-only snapshots of lock state for operators. Output is fully
//! deterministic: locks are ordered by ID and the shard lists are
//! lexicographically sorted.

use serde::Serialize;

use crate::lock::Lock;

/// Lock mode string reported for optimistically coordinated targets.
pub const LOCK_MODE_OPTIMISTIC: &str = "ShardOptimistic";

/// One row of `ShowLocks` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdlLock {
    /// The lock ID.
    pub id: String,
    /// Replication task name.
    pub task: String,
    /// Coordination mode; always [`LOCK_MODE_OPTIMISTIC`] here.
    pub mode: String,
    /// Lock owner; unused in optimistic mode, always empty.
    pub owner: String,
    /// Owner DDLs; unused in optimistic mode, always `None`.
    pub ddls: Option<Vec<String>>,
    /// Shards whose last-known schema equals the joined schema.
    pub synced: Vec<String>,
    /// Shards still diverging from the joined schema.
    pub unsynced: Vec<String>,
}

/// Formats a shard for display: ``{source}-`{upSchema}`.`{upTable}` ``.
#[must_use]
pub fn shard_display(source: &str, up_schema: &str, up_table: &str) -> String {
    format!("{source}-`{up_schema}`.`{up_table}`")
}

impl DdlLock {
    /// Builds the query row for one lock.
    #[must_use]
    pub fn from_lock(lock: &Lock) -> Self {
        let (synced, unsynced) = lock.synced_partition();
        let mut synced: Vec<String> = synced
            .iter()
            .map(|(s, sch, tbl)| shard_display(s, sch, tbl))
            .collect();
        let mut unsynced: Vec<String> = unsynced
            .iter()
            .map(|(s, sch, tbl)| shard_display(s, sch, tbl))
            .collect();
        synced.sort();
        unsynced.sort();
        Self {
            id: lock.id().to_string(),
            task: lock.task().to_string(),
            mode: LOCK_MODE_OPTIMISTIC.to_string(),
            owner: String::new(),
            ddls: None,
            synced,
            unsynced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::Info;
    use crate::lock::Lock;
    use crate::schema::{ColumnDef, TableSchema};
    use crate::topology::SourceTables;

    #[test]
    fn shard_display_quotes_identifiers() {
        assert_eq!(
            shard_display("mysql-replica-1", "foo", "bar-1"),
            "mysql-replica-1-`foo`.`bar-1`"
        );
    }

    #[test]
    fn from_lock_sorts_shard_lists() {
        let ti0 = TableSchema::new("bar").with_column(ColumnDef::new("id", "INT").primary_key());
        let ti1 = ti0.clone().with_column(ColumnDef::new("c1", "INT"));
        let mut lock = Lock::new("task", "foo", "bar", ti0.clone());

        let mut st = SourceTables::new("task", "mysql-replica-1");
        st.add_table("foo", "bar-2", "foo", "bar");
        st.add_table("foo", "bar-1", "foo", "bar");
        let tts = vec![st.target_table("foo", "bar")];

        let mut info = Info::new(
            "task",
            "mysql-replica-1",
            "foo",
            "bar-1",
            "foo",
            "bar",
            vec!["ALTER TABLE bar ADD COLUMN c1 INT".into()],
            ti0,
            vec![ti1],
        );
        info.version = 1;
        lock.try_sync(&info, &tts).unwrap();

        let row = DdlLock::from_lock(&lock);
        assert_eq!(row.id, "task-`foo`.`bar`");
        assert_eq!(row.mode, LOCK_MODE_OPTIMISTIC);
        assert_eq!(row.owner, "");
        assert!(row.ddls.is_none());
        assert_eq!(row.synced, vec!["mysql-replica-1-`foo`.`bar-1`"]);
        assert_eq!(row.unsynced, vec!["mysql-replica-1-`foo`.`bar-2`"]);
    }
}
