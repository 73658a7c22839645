//! In-memory registry of which shards feed which downstream table.
//!
//! The registry is rebuilt from a [`SourceTables`] snapshot on startup and
//! maintained by the source-tables watcher afterwards. It is a pure lookup
//! structure: all mutation flows through the coordinator's dispatcher.

use std::collections::BTreeMap;

use crate::topology::{SourceTables, TargetTable};

/// Registry of upstream table declarations, keyed `task → source`.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<String, BTreeMap<String, SourceTables>>,
}

impl TableRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the registry content with a snapshot.
    pub fn init(&mut self, all: Vec<SourceTables>) {
        self.tables.clear();
        for st in all {
            self.update(st);
        }
    }

    /// Inserts or replaces one `(task, source)` declaration. Returns the
    /// previous declaration, if any.
    pub fn update(&mut self, st: SourceTables) -> Option<SourceTables> {
        self.tables
            .entry(st.task.clone())
            .or_default()
            .insert(st.source.clone(), st)
    }

    /// Removes one `(task, source)` declaration.
    pub fn remove(&mut self, task: &str, source: &str) -> Option<SourceTables> {
        let sources = self.tables.get_mut(task)?;
        let removed = sources.remove(source);
        if sources.is_empty() {
            self.tables.remove(task);
        }
        removed
    }

    /// Returns the current declaration for one `(task, source)`.
    #[must_use]
    pub fn get(&self, task: &str, source: &str) -> Option<&SourceTables> {
        self.tables.get(task)?.get(source)
    }

    /// Returns, per source and ordered by source name, the upstream tables
    /// feeding one downstream table. Sources that do not feed the target
    /// are omitted; the result is empty when nothing does.
    #[must_use]
    pub fn find_tables(
        &self,
        task: &str,
        down_schema: &str,
        down_table: &str,
    ) -> Vec<TargetTable> {
        let Some(sources) = self.tables.get(task) else {
            return Vec::new();
        };
        sources
            .values()
            .map(|st| st.target_table(down_schema, down_table))
            .filter(|tt| !tt.is_empty())
            .collect()
    }
}
