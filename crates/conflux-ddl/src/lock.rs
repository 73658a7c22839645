//! Per-target shard DDL locks.
//!
//! A [`Lock`] tracks one downstream table through one round of schema
//! change: which shards have reported ([`Lock::is_synced`]), which have
//! acknowledged their instruction, and whether every shard has converged
//! on the joined schema ([`Lock::is_resolved`]).
//!
//! All mutation goes through the coordinator's dispatcher; queries receive
//! deep copies.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::info::Info;
use crate::operation::ConflictStage;
use crate::schema::{join_all, TableSchema};
use crate::topology::TargetTable;

/// Builds the lock ID for a downstream target.
#[must_use]
pub fn lock_id(task: &str, down_schema: &str, down_table: &str) -> String {
    format!("{task}-`{down_schema}`.`{down_table}`")
}

/// Per-shard coordination state inside a lock.
#[derive(Debug, Clone, PartialEq)]
struct ShardState {
    /// Last-known schema of the shard.
    schema: TableSchema,
    /// Whether the shard has reported an Info for the current round.
    ready: bool,
    /// Whether the shard has acknowledged its derived operation.
    done: bool,
    /// Largest report version observed for the shard.
    version: i64,
}

/// One logical shard-DDL lock for a downstream table.
#[derive(Debug, Clone)]
pub struct Lock {
    id: String,
    task: String,
    down_schema: String,
    down_table: String,
    /// Baseline schema shards are seeded with until they report.
    init: TableSchema,
    /// Current joined schema across all participating shards.
    joined: TableSchema,
    /// `source → upSchema → upTable → state`.
    shards: BTreeMap<String, BTreeMap<String, BTreeMap<String, ShardState>>>,
}

impl Lock {
    /// Creates a lock for one target with its baseline schema.
    #[must_use]
    pub fn new(
        task: impl Into<String>,
        down_schema: impl Into<String>,
        down_table: impl Into<String>,
        init: TableSchema,
    ) -> Self {
        let task = task.into();
        let down_schema = down_schema.into();
        let down_table = down_table.into();
        Self {
            id: lock_id(&task, &down_schema, &down_table),
            joined: init.clone(),
            init,
            task,
            down_schema,
            down_table,
            shards: BTreeMap::new(),
        }
    }

    /// The lock ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The replication task this lock belongs to.
    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }

    /// The downstream schema name.
    #[must_use]
    pub fn down_schema(&self) -> &str {
        &self.down_schema
    }

    /// The downstream table name.
    #[must_use]
    pub fn down_table(&self) -> &str {
        &self.down_table
    }

    /// The current joined schema.
    #[must_use]
    pub fn joined(&self) -> &TableSchema {
        &self.joined
    }

    /// The baseline schema the lock was created with.
    #[must_use]
    pub fn init_schema(&self) -> &TableSchema {
        &self.init
    }

    fn shard(&self, source: &str, up_schema: &str, up_table: &str) -> Option<&ShardState> {
        self.shards.get(source)?.get(up_schema)?.get(up_table)
    }

    fn shard_mut(
        &mut self,
        source: &str,
        up_schema: &str,
        up_table: &str,
    ) -> Option<&mut ShardState> {
        self.shards
            .get_mut(source)?
            .get_mut(up_schema)?
            .get_mut(up_table)
    }

    /// Returns whether the shard participates in this lock.
    #[must_use]
    pub fn has_shard(&self, source: &str, up_schema: &str, up_table: &str) -> bool {
        self.shard(source, up_schema, up_table).is_some()
    }

    /// Returns whether any shard of the given source participates.
    #[must_use]
    pub fn has_source(&self, source: &str) -> bool {
        self.shards.contains_key(source)
    }

    fn ensure_shard(&mut self, source: &str, up_schema: &str, up_table: &str) {
        let seed = self.init.clone();
        self.shards
            .entry(source.to_string())
            .or_default()
            .entry(up_schema.to_string())
            .or_default()
            .entry(up_table.to_string())
            .or_insert_with(|| ShardState {
                schema: seed,
                ready: false,
                done: false,
                version: 0,
            });
    }

    /// Adds every registry-known shard of this target that the lock has
    /// not seen yet, seeded with the baseline schema (newly created
    /// tables join the round un-ready).
    pub fn add_tables(&mut self, target_tables: &[TargetTable]) {
        for tt in target_tables {
            if tt.task != self.task
                || tt.down_schema != self.down_schema
                || tt.down_table != self.down_table
            {
                continue;
            }
            for (up_schema, up_tables) in &tt.up_tables {
                for up_table in up_tables {
                    self.ensure_shard(&tt.source, up_schema, up_table);
                }
            }
        }
    }

    /// Applies one shard report and derives the DDLs that shard must run.
    ///
    /// Per `(ddl, post_schema)` pair the shard's recorded schema advances
    /// and the joined schema is recomputed. The DDL is emitted when the
    /// join moved strictly forward (the shard is first to introduce the
    /// change) or the shard's schema now equals the joined schema (it is
    /// the last to catch up, including the join receding after the final
    /// drop). A join failure reverts the pair and reports
    /// [`ConflictStage::Detected`] with no DDLs.
    ///
    /// Returns `None` when the report is stale (older version than
    /// already recorded) and must be discarded.
    pub fn try_sync(
        &mut self,
        info: &Info,
        target_tables: &[TargetTable],
    ) -> Option<(Vec<String>, ConflictStage)> {
        if let Some(state) = self.shard(&info.source, &info.up_schema, &info.up_table) {
            if info.version < state.version {
                return None;
            }
        }

        self.add_tables(target_tables);
        self.ensure_shard(&info.source, &info.up_schema, &info.up_table);

        let mut emitted = Vec::new();
        let mut conflict = false;
        for (ddl, post) in info.ddls.iter().zip(&info.post_schemas) {
            let prev = match self.shard_mut(&info.source, &info.up_schema, &info.up_table) {
                Some(state) => std::mem::replace(&mut state.schema, post.clone()),
                None => break,
            };

            let joined = join_all(self.all_schemas());
            match joined {
                Err(_) => {
                    if let Some(state) =
                        self.shard_mut(&info.source, &info.up_schema, &info.up_table)
                    {
                        state.schema = prev;
                    }
                    conflict = true;
                    break;
                }
                Ok(Some(new_joined)) => {
                    let moved_forward =
                        matches!(new_joined.compare(&self.joined), Some(Ordering::Greater));
                    if moved_forward || post.eq_columns(&new_joined) {
                        emitted.push(ddl.clone());
                    }
                    self.joined = new_joined;
                }
                Ok(None) => {}
            }
        }

        if let Some(state) = self.shard_mut(&info.source, &info.up_schema, &info.up_table) {
            state.ready = true;
            state.done = false;
            state.version = info.version;
        }

        if conflict {
            Some((Vec::new(), ConflictStage::Detected))
        } else {
            Some((emitted, ConflictStage::None))
        }
    }

    fn all_schemas(&self) -> impl Iterator<Item = &TableSchema> {
        self.shards
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .map(|state| &state.schema)
    }

    /// Marks a shard's operation as acknowledged. Returns whether the
    /// shard is known to this lock.
    pub fn mark_done(&mut self, source: &str, up_schema: &str, up_table: &str) -> bool {
        match self.shard_mut(source, up_schema, up_table) {
            Some(state) => {
                state.done = true;
                true
            }
            None => false,
        }
    }

    /// Returns whether a shard has acknowledged its operation.
    #[must_use]
    pub fn is_done(&self, source: &str, up_schema: &str, up_table: &str) -> bool {
        self.shard(source, up_schema, up_table)
            .is_some_and(|state| state.done)
    }

    /// Returns whether every shard has reported for the current round,
    /// and how many have not.
    #[must_use]
    pub fn is_synced(&self) -> (bool, usize) {
        let remain = self
            .shards
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .filter(|state| !state.ready)
            .count();
        (remain == 0, remain)
    }

    /// Returns whether the lock is fully resolved: every shard reported,
    /// acknowledged, and converged on the joined schema.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        let (synced, _) = self.is_synced();
        synced
            && self
                .shards
                .values()
                .flat_map(BTreeMap::values)
                .flat_map(BTreeMap::values)
                .all(|state| state.done && state.schema.eq_columns(&self.joined))
    }

    /// Snapshot of per-shard ready flags, `source → upSchema → upTable`.
    #[must_use]
    pub fn ready(&self) -> BTreeMap<String, BTreeMap<String, BTreeMap<String, bool>>> {
        self.shards
            .iter()
            .map(|(source, schemas)| {
                (
                    source.clone(),
                    schemas
                        .iter()
                        .map(|(up_schema, tables)| {
                            (
                                up_schema.clone(),
                                tables
                                    .iter()
                                    .map(|(up_table, state)| (up_table.clone(), state.ready))
                                    .collect(),
                            )
                        })
                        .collect(),
                )
            })
            .collect()
    }

    /// Splits the membership into shards whose last-known schema equals
    /// the joined schema and those still diverging. For drop-column
    /// rounds the shards that already dropped land in the second list.
    #[must_use]
    pub fn synced_partition(
        &self,
    ) -> (
        Vec<(String, String, String)>,
        Vec<(String, String, String)>,
    ) {
        let mut synced = Vec::new();
        let mut unsynced = Vec::new();
        for (source, schemas) in &self.shards {
            for (up_schema, tables) in schemas {
                for (up_table, state) in tables {
                    let entry = (source.clone(), up_schema.clone(), up_table.clone());
                    if state.schema.eq_columns(&self.joined) {
                        synced.push(entry);
                    } else {
                        unsynced.push(entry);
                    }
                }
            }
        }
        (synced, unsynced)
    }

    /// Lists every shard participating in this lock.
    #[must_use]
    pub fn shard_tables(&self) -> Vec<(String, String, String)> {
        self.shards
            .iter()
            .flat_map(|(source, schemas)| {
                schemas.iter().flat_map(move |(up_schema, tables)| {
                    tables.keys().map(move |up_table| {
                        (source.clone(), up_schema.clone(), up_table.clone())
                    })
                })
            })
            .collect()
    }

    /// Removes a shard from the lock (dropped table or removed source).
    /// The departed shard counts as converged by absence. Returns whether
    /// it was a member.
    pub fn remove_shard(&mut self, source: &str, up_schema: &str, up_table: &str) -> bool {
        let Some(schemas) = self.shards.get_mut(source) else {
            return false;
        };
        let Some(tables) = schemas.get_mut(up_schema) else {
            return false;
        };
        let removed = tables.remove(up_table).is_some();
        if tables.is_empty() {
            schemas.remove(up_schema);
        }
        if schemas.is_empty() {
            self.shards.remove(source);
        }
        removed
    }

    /// Removes every shard of one source. Returns how many were removed.
    pub fn remove_source(&mut self, source: &str) -> usize {
        match self.shards.remove(source) {
            Some(schemas) => schemas.values().map(BTreeMap::len).sum(),
            None => 0,
        }
    }

    /// Returns whether no shard participates anymore.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

// ============================================================================
// LockKeeper
// ============================================================================

/// Owner of all in-memory locks.
#[derive(Debug, Clone, Default)]
pub struct LockKeeper {
    locks: BTreeMap<String, Lock>,
}

impl LockKeeper {
    /// Creates an empty keeper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for the report's target, creating it with the
    /// given baseline schema when absent.
    pub fn find_or_create(&mut self, info: &Info, init: TableSchema) -> &mut Lock {
        let id = lock_id(&info.task, &info.down_schema, &info.down_table);
        self.locks.entry(id).or_insert_with(|| {
            Lock::new(
                info.task.clone(),
                info.down_schema.clone(),
                info.down_table.clone(),
                init,
            )
        })
    }

    /// Looks up a lock by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Lock> {
        self.locks.get(id)
    }

    /// Looks up a lock by ID, mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Lock> {
        self.locks.get_mut(id)
    }

    /// Finds the ID of the lock a shard participates in, if any.
    #[must_use]
    pub fn find_by_table(
        &self,
        task: &str,
        source: &str,
        up_schema: &str,
        up_table: &str,
    ) -> Option<String> {
        self.locks
            .values()
            .find(|lock| lock.task() == task && lock.has_shard(source, up_schema, up_table))
            .map(|lock| lock.id().to_string())
    }

    /// Removes a lock.
    pub fn remove(&mut self, id: &str) -> Option<Lock> {
        self.locks.remove(id)
    }

    /// The lock map, ordered by ID.
    #[must_use]
    pub fn locks(&self) -> &BTreeMap<String, Lock> {
        &self.locks
    }

    /// Deep copy of the lock map for queries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Lock> {
        self.locks.clone()
    }

    /// Iterates over all locks mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Lock)> {
        self.locks.iter_mut()
    }
}
