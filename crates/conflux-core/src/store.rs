//! Revisioned metadata store abstraction.
//!
//! This module defines the store contract every Conflux participant shares:
//! a key-value namespace with a single monotonically increasing revision
//! counter, multi-key transactions, and prefix watches that can replay from
//! an arbitrary revision.
//!
//! The contract deliberately mirrors the semantics of etcd-style stores:
//!
//! - Every mutation is assigned a global **revision**; all keys written by
//!   one transaction share the same revision.
//! - Each key additionally carries a **version**: the number of puts since
//!   the key was created. Deleting a key resets its version.
//! - `watch(prefix, from_revision)` delivers every event with
//!   `mod_revision >= from_revision` in revision order, then streams live
//!   events. Combined with a snapshot taken at revision `R`, watching from
//!   `R + 1` loses nothing and duplicates nothing.
//!
//! [`MemoryMetaStore`] is the in-process backend used by tests. Production
//! deployments wrap a real etcd client behind the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// The store's global sequence number.
pub type Revision = i64;

/// A key-value entry together with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The full key.
    pub key: String,
    /// The value bytes. Empty for delete events.
    pub value: Bytes,
    /// Revision at which the key was created.
    pub create_revision: Revision,
    /// Revision of the last modification.
    pub mod_revision: Revision,
    /// Number of puts since the key was created. Zero for delete events.
    pub version: i64,
}

/// The kind of change a watch event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A key was created or updated.
    Put,
    /// A key was removed.
    Delete,
}

/// A single change observed by a watcher.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Whether the key was put or deleted.
    pub event_type: EventType,
    /// The affected entry. For deletes the value is empty and the version
    /// is zero; `mod_revision` is the revision of the deleting mutation.
    pub kv: KeyValue,
}

/// One mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Write a key.
    Put {
        /// The key to write.
        key: String,
        /// The value to store.
        value: Bytes,
    },
    /// Remove a key (idempotent).
    Delete {
        /// The key to remove.
        key: String,
    },
    /// Remove every key under a prefix.
    DeletePrefix {
        /// The prefix to clear.
        prefix: String,
    },
}

/// A condition a transaction is guarded by.
#[derive(Debug, Clone)]
pub enum TxnCond {
    /// The key must exist.
    KeyExists {
        /// The key to check.
        key: String,
    },
    /// The key must not exist.
    KeyAbsent {
        /// The key to check.
        key: String,
    },
    /// The key must exist with exactly this `mod_revision`.
    ModRevisionEq {
        /// The key to check.
        key: String,
        /// The required modification revision.
        revision: Revision,
    },
}

/// Outcome of a transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxnResult {
    /// Whether all conditions held and the operations were applied.
    pub succeeded: bool,
    /// The store revision after the call. Unchanged when `succeeded` is
    /// false or the transaction was a no-op.
    pub revision: Revision,
}

/// Outcome of a single put.
#[derive(Debug, Clone, Copy)]
pub struct PutResult {
    /// The revision assigned to the write.
    pub revision: Revision,
    /// The key's version after the write.
    pub version: i64,
}

/// A stream of watch events for one prefix.
///
/// The stream ends when the store drops the watcher (shutdown or backend
/// reconnect); callers re-establish from the last processed revision.
#[derive(Debug)]
pub struct WatchStream {
    receiver: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    /// Receives the next event, or `None` when the stream has ended.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }
}

/// The metadata store contract.
///
/// Implementations must be cheap to share (`Arc<dyn MetaStore>`) and safe
/// to call from any task.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Returns the current store revision.
    async fn current_revision(&self) -> Result<Revision>;

    /// Reads a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Reads every key under a prefix, together with the revision the
    /// snapshot was taken at.
    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision)>;

    /// Writes a key unconditionally.
    async fn put(&self, key: &str, value: Bytes) -> Result<PutResult>;

    /// Removes a key (idempotent). Returns the store revision after the
    /// call.
    async fn delete(&self, key: &str) -> Result<Revision>;

    /// Applies `ops` atomically iff every condition in `conds` holds.
    async fn txn(&self, conds: Vec<TxnCond>, ops: Vec<TxnOp>) -> Result<TxnResult>;

    /// Opens a watch over `prefix`, replaying history from
    /// `from_revision` before streaming live events.
    async fn watch(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory metadata store for testing.
///
/// Keeps the full event history so watches can replay from any revision.
/// Thread-safe via a single mutex; not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    revision: Revision,
    entries: BTreeMap<String, StoredEntry>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Bytes,
    create_revision: Revision,
    version: i64,
    mod_revision: Revision,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

impl MemoryMetaStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>> {
        self.inner.lock().map_err(|_| Error::Internal {
            message: "store lock poisoned".into(),
        })
    }
}

impl StoreInner {
    fn kv(&self, key: &str) -> Option<KeyValue> {
        self.entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            create_revision: e.create_revision,
            mod_revision: e.mod_revision,
            version: e.version,
        })
    }

    fn apply_put(&mut self, key: &str, value: Bytes, revision: Revision) -> i64 {
        let entry = match self.entries.get(key) {
            Some(prev) => StoredEntry {
                value,
                create_revision: prev.create_revision,
                version: prev.version + 1,
                mod_revision: revision,
            },
            None => StoredEntry {
                value,
                create_revision: revision,
                version: 1,
                mod_revision: revision,
            },
        };
        let version = entry.version;
        let kv = KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            create_revision: entry.create_revision,
            mod_revision: entry.mod_revision,
            version: entry.version,
        };
        self.entries.insert(key.to_string(), entry);
        self.emit(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
        version
    }

    fn apply_delete(&mut self, key: &str, revision: Revision) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.emit(WatchEvent {
            event_type: EventType::Delete,
            kv: deleted_kv(key, revision),
        });
        true
    }

    fn emit(&mut self, event: WatchEvent) {
        self.history.push(event.clone());
        self.watchers.retain(|w| {
            if event.kv.key.starts_with(&w.prefix) {
                w.sender.send(event.clone()).is_ok()
            } else {
                !w.sender.is_closed()
            }
        });
    }

    fn check(&self, cond: &TxnCond) -> bool {
        match cond {
            TxnCond::KeyExists { key } => self.entries.contains_key(key),
            TxnCond::KeyAbsent { key } => !self.entries.contains_key(key),
            TxnCond::ModRevisionEq { key, revision } => self
                .entries
                .get(key)
                .is_some_and(|e| e.mod_revision == *revision),
        }
    }
}

fn deleted_kv(key: &str, revision: Revision) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Bytes::new(),
        create_revision: 0,
        mod_revision: revision,
        version: 0,
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn current_revision(&self) -> Result<Revision> {
        Ok(self.lock()?.revision)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.lock()?.kv(key))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision)> {
        let inner = self.lock()?;
        let entries = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, _)| inner.kv(k))
            .collect();
        Ok((entries, inner.revision))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<PutResult> {
        let mut inner = self.lock()?;
        inner.revision += 1;
        let revision = inner.revision;
        let version = inner.apply_put(key, value, revision);
        Ok(PutResult { revision, version })
    }

    async fn delete(&self, key: &str) -> Result<Revision> {
        let mut inner = self.lock()?;
        if inner.entries.contains_key(key) {
            inner.revision += 1;
            let revision = inner.revision;
            inner.apply_delete(key, revision);
        }
        Ok(inner.revision)
    }

    async fn txn(&self, conds: Vec<TxnCond>, ops: Vec<TxnOp>) -> Result<TxnResult> {
        let mut inner = self.lock()?;
        if !conds.iter().all(|c| inner.check(c)) {
            return Ok(TxnResult {
                succeeded: false,
                revision: inner.revision,
            });
        }
        if ops.is_empty() {
            return Ok(TxnResult {
                succeeded: true,
                revision: inner.revision,
            });
        }

        // All operations of one transaction share a single revision.
        inner.revision += 1;
        let revision = inner.revision;
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    inner.apply_put(&key, value, revision);
                }
                TxnOp::Delete { key } => {
                    inner.apply_delete(&key, revision);
                }
                TxnOp::DeletePrefix { prefix } => {
                    let keys: Vec<String> = inner
                        .entries
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in keys {
                        inner.apply_delete(&key, revision);
                    }
                }
            }
        }
        Ok(TxnResult {
            succeeded: true,
            revision,
        })
    }

    async fn watch(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream> {
        let mut inner = self.lock()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        for event in &inner.history {
            if event.kv.mod_revision >= from_revision && event.kv.key.starts_with(prefix) {
                // Receiver is still in scope; an unbounded send only fails
                // on disconnect.
                let _ = sender.send(event.clone());
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender,
        });
        Ok(WatchStream { receiver })
    }
}
