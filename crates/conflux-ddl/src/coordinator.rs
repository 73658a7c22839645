//! The coordinator: snapshot replay, watch dispatch, and lock lifecycle.
//!
//! One [`Coordinator`] drives all shard-DDL locks of a metadata store.
//! [`Coordinator::start`] takes a snapshot at some revision, rebuilds the
//! table registry and every lock from it, then follows the source-tables,
//! info, and operation streams from the next revision on, so no event is
//! lost and none is applied twice across restarts.
//!
//! Watchers are producer-only: they decode store events and forward them
//! into one channel. A single dispatcher task owns every mutation of the
//! registry and the lock table; queries take a read lock and return deep
//! copies. Replay rebuilds lock state without writing operations: the
//! surviving Info keys re-drive any instruction a shard has not
//! acknowledged yet.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use conflux_core::observability::coordinator_span;
use conflux_core::{
    EventType, InfoKey, InitSchemaKey, MetaStore, OperationKey, Revision, SourceTablesKey, TxnOp,
    WatchEvent,
};

use crate::announce::{messages_for, ResolutionEvent};
use crate::error::Result;
use crate::info::{self, Info};
use crate::init_schema;
use crate::lock::{lock_id, Lock, LockKeeper};
use crate::metrics::{labels, names};
use crate::operation::{self, ConflictStage, Operation};
use crate::query::DdlLock;
use crate::registry::TableRegistry;
use crate::schema::TableSchema;
use crate::topology::{self, SourceTables};

const WATCH_BACKOFF_BASE: Duration = Duration::from_millis(100);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Downstream database connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamConfig {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// User name.
    pub user: String,
}

/// Downstream metadata for one task, supplied at construction.
#[derive(Debug, Clone, Default)]
pub struct DownstreamMeta {
    /// Connection settings, when the embedding controller has them.
    pub config: Option<DownstreamConfig>,
    /// Name of the downstream meta schema.
    pub schema: String,
}

/// Callback resolving a task name to its downstream metadata.
pub type DownstreamMetaFn = Arc<dyn Fn(&str) -> DownstreamMeta + Send + Sync>;

/// Events forwarded from the watchers to the dispatcher.
#[derive(Debug)]
enum CoordEvent {
    SourceTablesPut(SourceTables),
    SourceTablesDelete { task: String, source: String },
    Info(Info),
    OperationDone(Operation),
}

#[derive(Default)]
struct CoordState {
    registry: TableRegistry,
    keeper: LockKeeper,
}

struct Runtime {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// The optimistic shard-DDL coordinator.
pub struct Coordinator {
    downstream_meta: DownstreamMetaFn,
    state: Arc<RwLock<CoordState>>,
    announce_tx: broadcast::Sender<ResolutionEvent>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

// Mutation is single-writer (the dispatcher task), so even a poisoned
// guard holds consistent state and can be recovered.
fn read_state(state: &RwLock<CoordState>) -> std::sync::RwLockReadGuard<'_, CoordState> {
    state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_state(state: &RwLock<CoordState>) -> std::sync::RwLockWriteGuard<'_, CoordState> {
    state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Coordinator {
    /// Creates a coordinator. It does nothing until [`Coordinator::start`].
    #[must_use]
    pub fn new(downstream_meta: DownstreamMetaFn) -> Self {
        let (announce_tx, _) = broadcast::channel(64);
        Self {
            downstream_meta,
            state: Arc::new(RwLock::new(CoordState::default())),
            announce_tx,
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribes to resolved schema-change announcements.
    #[must_use]
    pub fn subscribe_resolutions(&self) -> broadcast::Receiver<ResolutionEvent> {
        self.announce_tx.subscribe()
    }

    /// Starts the coordinator against a store: snapshot, replay, watch.
    ///
    /// Idempotent: calling `start` while running is a no-op, and `start`
    /// after [`Coordinator::close`] rebuilds all state from the store.
    /// Never blocks beyond the initial snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot cannot be read; the coordinator
    /// refuses to run on a store it cannot recover from.
    pub async fn start(&self, store: Arc<dyn MetaStore>) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        // The revision is read first and the watchers start right after
        // it, so the prefix snapshots below may already include later
        // writes; the dispatcher tolerates the redelivery.
        let rev0 = store.current_revision().await?;
        let (source_tables, _) = topology::get_all_source_tables(store.as_ref()).await?;
        let (infos, _) = info::get_all_info(store.as_ref()).await?;
        let (operations, _) = operation::get_all_operations(store.as_ref()).await?;
        let (init_schemas, _) = init_schema::get_all_init_schemas(store.as_ref()).await?;

        {
            let mut state = write_state(&self.state);
            *state = CoordState::default();
            state.registry.init(source_tables);

            for info in info::sort_infos(infos) {
                let tts =
                    state
                        .registry
                        .find_tables(&info.task, &info.down_schema, &info.down_table);
                let baseline = init_schemas
                    .get(&(
                        info.task.clone(),
                        info.down_schema.clone(),
                        info.down_table.clone(),
                    ))
                    .cloned()
                    .unwrap_or_else(|| info.pre_schema.clone());
                let lock = state.keeper.find_or_create(&info, baseline);
                // Replay only rebuilds lock state; operations are never
                // re-emitted here.
                let _ = lock.try_sync(&info, &tts);
            }

            for op in operations.iter().filter(|op| op.done) {
                let Some(id) =
                    state
                        .keeper
                        .find_by_table(&op.task, &op.source, &op.up_schema, &op.up_table)
                else {
                    continue;
                };
                if let Some(lock) = state.keeper.get_mut(&id) {
                    lock.mark_done(&op.source, &op.up_schema, &op.up_table);
                }
            }

            let locks = state.keeper.locks().len();
            gauge!(names::ACTIVE_LOCKS).set(locks_gauge(locks));
            tracing::info!(revision = rev0, locks, "coordinator state recovered");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            spawn_watcher(
                "source-tables",
                SourceTablesKey::prefix(),
                Arc::clone(&store),
                rev0 + 1,
                tx.clone(),
                shutdown_rx.clone(),
                decode_source_tables_event,
            ),
            spawn_watcher(
                "info",
                InfoKey::prefix(),
                Arc::clone(&store),
                rev0 + 1,
                tx.clone(),
                shutdown_rx.clone(),
                decode_info_event,
            ),
            spawn_watcher(
                "operation",
                OperationKey::prefix(),
                Arc::clone(&store),
                rev0 + 1,
                tx,
                shutdown_rx,
                decode_operation_event,
            ),
            tokio::spawn(
                Dispatcher {
                    state: Arc::clone(&self.state),
                    store,
                    announce: self.announce_tx.clone(),
                    downstream_meta: Arc::clone(&self.downstream_meta),
                }
                .run(rx),
            ),
        ];

        *runtime = Some(Runtime {
            shutdown: shutdown_tx,
            tasks,
        });
        Ok(())
    }

    /// Stops the watchers, drains the dispatcher, and waits for all tasks
    /// to exit. Safe to call repeatedly and before `start`.
    pub async fn close(&self) {
        let mut runtime = self.runtime.lock().await;
        let Some(runtime) = runtime.take() else {
            return;
        };
        let _ = runtime.shutdown.send(true);
        for task in runtime.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "coordinator task aborted uncleanly");
            }
        }
        tracing::info!("coordinator closed");
    }

    /// Deep copy of the current lock table, keyed by lock ID.
    #[must_use]
    pub fn locks(&self) -> BTreeMap<String, Lock> {
        read_state(&self.state).keeper.snapshot()
    }

    /// Returns which upstream tables currently feed one downstream table,
    /// ordered by source name.
    #[must_use]
    pub fn find_tables(
        &self,
        task: &str,
        down_schema: &str,
        down_table: &str,
    ) -> Vec<crate::topology::TargetTable> {
        read_state(&self.state)
            .registry
            .find_tables(task, down_schema, down_table)
    }

    /// `ShowLocks`: one row per matching lock, ordered by lock ID.
    ///
    /// An empty `task` matches every task; an empty `sources` matches
    /// every source. Unknown names simply match nothing.
    #[must_use]
    pub fn show_locks(&self, task: &str, sources: &[String]) -> Vec<DdlLock> {
        let state = read_state(&self.state);
        state
            .keeper
            .locks()
            .values()
            .filter(|lock| task.is_empty() || lock.task() == task)
            .filter(|lock| {
                sources.is_empty() || sources.iter().any(|source| lock.has_source(source))
            })
            .map(DdlLock::from_lock)
            .collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn locks_gauge(locks: usize) -> f64 {
    locks as f64
}

// ============================================================================
// Watchers
// ============================================================================

fn spawn_watcher(
    name: &'static str,
    prefix: String,
    store: Arc<dyn MetaStore>,
    from: Revision,
    tx: mpsc::UnboundedSender<CoordEvent>,
    mut shutdown: watch::Receiver<bool>,
    decode: fn(&WatchEvent) -> Option<CoordEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next = from;
        let mut backoff = WATCH_BACKOFF_BASE;
        loop {
            let mut stream = tokio::select! {
                _ = shutdown.changed() => return,
                result = store.watch(&prefix, next) => match result {
                    Ok(stream) => {
                        backoff = WATCH_BACKOFF_BASE;
                        stream
                    }
                    Err(err) => {
                        tracing::warn!(stream = name, error = %err, "watch failed, backing off");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
                        continue;
                    }
                },
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = stream.recv() => match event {
                        Some(event) => {
                            next = event.kv.mod_revision + 1;
                            counter!(names::EVENTS_TOTAL, labels::STREAM => name).increment(1);
                            if let Some(msg) = decode(&event) {
                                if tx.send(msg).is_err() {
                                    return;
                                }
                            }
                        }
                        None => {
                            tracing::warn!(
                                stream = name,
                                revision = next,
                                "watch stream closed, re-establishing"
                            );
                            break;
                        }
                    },
                }
            }
        }
    })
}

fn decode_source_tables_event(event: &WatchEvent) -> Option<CoordEvent> {
    match event.event_type {
        EventType::Put => match topology::source_tables_from_kv(&event.kv) {
            Ok(st) => Some(CoordEvent::SourceTablesPut(st)),
            Err(err) => {
                tracing::error!(key = %event.kv.key, error = %err, "undecodable source-tables event");
                None
            }
        },
        EventType::Delete => {
            let (task, source) = SourceTablesKey::parse(&event.kv.key)?;
            Some(CoordEvent::SourceTablesDelete { task, source })
        }
    }
}

fn decode_info_event(event: &WatchEvent) -> Option<CoordEvent> {
    match event.event_type {
        EventType::Put => match info::info_from_kv(&event.kv) {
            Ok(info) => Some(CoordEvent::Info(info)),
            Err(err) => {
                tracing::error!(key = %event.kv.key, error = %err, "undecodable info event");
                None
            }
        },
        // Info deletions are side effects of table drops and lock
        // resolution; the source-tables stream carries the state change.
        EventType::Delete => None,
    }
}

fn decode_operation_event(event: &WatchEvent) -> Option<CoordEvent> {
    match event.event_type {
        EventType::Put => match operation::operation_from_kv(&event.kv) {
            Ok(op) if op.done => Some(CoordEvent::OperationDone(op)),
            Ok(_) => None,
            Err(err) => {
                tracing::error!(key = %event.kv.key, error = %err, "undecodable operation event");
                None
            }
        },
        EventType::Delete => None,
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Dispatcher {
    state: Arc<RwLock<CoordState>>,
    store: Arc<dyn MetaStore>,
    announce: broadcast::Sender<ResolutionEvent>,
    downstream_meta: DownstreamMetaFn,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<CoordEvent>) {
        // Watchers drop their senders on shutdown, so `recv` drains the
        // queue and then ends the loop.
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.handle(event).await {
                tracing::error!(error = %err, "failed to handle coordination event");
            }
        }
    }

    async fn handle(&self, event: CoordEvent) -> Result<()> {
        match event {
            CoordEvent::SourceTablesPut(st) => {
                let span = coordinator_span("handle_source_tables_put", &st.task);
                self.handle_source_tables_put(st).instrument(span).await
            }
            CoordEvent::SourceTablesDelete { task, source } => {
                let span = coordinator_span("handle_source_tables_delete", &task);
                self.handle_source_tables_delete(&task, &source)
                    .instrument(span)
                    .await
            }
            CoordEvent::Info(info) => {
                let span = coordinator_span("handle_info", &info.task);
                self.handle_info(info).instrument(span).await
            }
            CoordEvent::OperationDone(op) => {
                let span = coordinator_span("handle_operation_done", &op.task);
                self.handle_operation_done(&op).instrument(span).await
            }
        }
    }

    async fn handle_info(&self, info: Info) -> Result<()> {
        let id = lock_id(&info.task, &info.down_schema, &info.down_table);
        let known = read_state(&self.state).keeper.get(&id).is_some();
        let baseline = if known {
            None
        } else {
            Some(self.baseline_for(&info).await?)
        };

        let (outcome, locks) = {
            let mut state = write_state(&self.state);
            let tts = state
                .registry
                .find_tables(&info.task, &info.down_schema, &info.down_table);
            let lock = match baseline {
                Some(baseline) => state.keeper.find_or_create(&info, baseline),
                None => state.keeper.find_or_create(&info, info.pre_schema.clone()),
            };
            let outcome = lock.try_sync(&info, &tts);
            (outcome, state.keeper.locks().len())
        };
        gauge!(names::ACTIVE_LOCKS).set(locks_gauge(locks));

        let Some((ddls, stage)) = outcome else {
            tracing::info!(
                lock = %id,
                source = %info.source,
                table = %info.up_table,
                version = info.version,
                "discarding stale shard report"
            );
            return Ok(());
        };

        if stage == ConflictStage::Detected {
            tracing::warn!(
                lock = %id,
                source = %info.source,
                schema = %info.up_schema,
                table = %info.up_table,
                "schema conflict detected, halting shard"
            );
        }

        let op = Operation::new(
            info.task.clone(),
            info.source.clone(),
            info.up_schema.clone(),
            info.up_table.clone(),
            ddls,
            stage,
        );
        self.put_operation_fenced(&info, &op).await?;
        counter!(names::OPERATIONS_TOTAL, labels::STAGE => stage.to_string()).increment(1);
        Ok(())
    }

    /// Resolves the baseline schema for a lock about to be created:
    /// the persisted init schema when one exists, otherwise the report's
    /// pre-schema, which is then persisted for future restarts.
    async fn baseline_for(&self, info: &Info) -> Result<TableSchema> {
        match init_schema::get_init_schema(
            self.store.as_ref(),
            &info.task,
            &info.down_schema,
            &info.down_table,
        )
        .await
        {
            Ok(Some(schema)) => return Ok(schema),
            Ok(None) => {}
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                tracing::error!(error = %err, "ignoring corrupt init schema");
            }
        }

        let meta = (self.downstream_meta)(&info.task);
        tracing::debug!(
            task = %info.task,
            down_schema = %info.down_schema,
            down_table = %info.down_table,
            meta_schema = %meta.schema,
            has_db_config = meta.config.is_some(),
            "bootstrapping lock from first shard report"
        );
        init_schema::put_init_schema_if_absent(
            self.store.as_ref(),
            &info.task,
            &info.down_schema,
            &info.down_table,
            &info.pre_schema,
        )
        .await?;
        Ok(info.pre_schema.clone())
    }

    /// Writes an operation fenced by its report's revision. When the
    /// fence fails, the report is re-read once: a still-identical report
    /// retries against the new revision, anything else means a newer
    /// report superseded this operation and it is dropped.
    async fn put_operation_fenced(&self, info: &Info, op: &Operation) -> Result<()> {
        let (_, putted) = operation::put_operation(self.store.as_ref(), op, info.revision).await?;
        if putted {
            return Ok(());
        }

        match self.store.get(info.key().as_ref()).await? {
            Some(kv) if kv.version == info.version => {
                let (_, putted) =
                    operation::put_operation(self.store.as_ref(), op, kv.mod_revision).await?;
                if !putted {
                    tracing::warn!(
                        source = %op.source,
                        table = %op.up_table,
                        "dropping operation after stale-write retry"
                    );
                }
            }
            _ => {
                tracing::info!(
                    source = %op.source,
                    table = %op.up_table,
                    "operation superseded by a newer shard report"
                );
            }
        }
        Ok(())
    }

    async fn handle_operation_done(&self, op: &Operation) -> Result<()> {
        let resolution = {
            let mut state = write_state(&self.state);
            let Some(id) =
                state
                    .keeper
                    .find_by_table(&op.task, &op.source, &op.up_schema, &op.up_table)
            else {
                tracing::warn!(
                    source = %op.source,
                    table = %op.up_table,
                    "acknowledgement for an unknown lock"
                );
                return Ok(());
            };
            let Some(lock) = state.keeper.get_mut(&id) else {
                return Ok(());
            };
            if !lock.mark_done(&op.source, &op.up_schema, &op.up_table) {
                tracing::error!(
                    lock = %id,
                    source = %op.source,
                    table = %op.up_table,
                    "lock found by shard lookup but shard is missing from it"
                );
                return Ok(());
            }
            tracing::info!(
                lock = %id,
                source = %op.source,
                schema = %op.up_schema,
                table = %op.up_table,
                "shard acknowledged its operation"
            );
            if lock.is_resolved() {
                state.keeper.remove(&id).map(|lock| plan_resolution(&lock))
            } else {
                None
            }
        };

        if let Some((event, cleanup)) = resolution {
            self.finish_resolution(event, cleanup).await?;
        }
        Ok(())
    }

    async fn handle_source_tables_put(&self, st: SourceTables) -> Result<()> {
        let resolutions = {
            let mut state = write_state(&self.state);
            let prev = state.registry.update(st.clone());
            let removed: Vec<_> = prev
                .map(|prev| {
                    prev.table_entries()
                        .into_iter()
                        .filter(|(ds, dt, us, ut)| !st.contains_table(ds, dt, us, ut))
                        .collect()
                })
                .unwrap_or_default();

            let mut resolved = Vec::new();
            for (down_schema, down_table, up_schema, up_table) in removed {
                let id = lock_id(&st.task, &down_schema, &down_table);
                let Some(lock) = state.keeper.get_mut(&id) else {
                    continue;
                };
                if lock.remove_shard(&st.source, &up_schema, &up_table) {
                    tracing::info!(
                        lock = %id,
                        source = %st.source,
                        schema = %up_schema,
                        table = %up_table,
                        "shard left lock, table dropped upstream"
                    );
                }
                if lock.is_resolved() {
                    resolved.push(id);
                }
            }

            let mut resolutions = Vec::new();
            for id in resolved {
                if let Some(lock) = state.keeper.remove(&id) {
                    resolutions.push(plan_resolution(&lock));
                }
            }
            resolutions
        };

        for (event, cleanup) in resolutions {
            self.finish_resolution(event, cleanup).await?;
        }
        Ok(())
    }

    async fn handle_source_tables_delete(&self, task: &str, source: &str) -> Result<()> {
        let resolutions = {
            let mut state = write_state(&self.state);
            state.registry.remove(task, source);

            let mut resolved = Vec::new();
            for (id, lock) in state.keeper.iter_mut() {
                if lock.task() != task {
                    continue;
                }
                let removed = lock.remove_source(source);
                if removed > 0 {
                    tracing::info!(lock = %id, source, removed, "source left lock, task removed");
                }
                if lock.is_resolved() {
                    resolved.push(id.clone());
                }
            }

            let mut resolutions = Vec::new();
            for id in resolved {
                if let Some(lock) = state.keeper.remove(&id) {
                    resolutions.push(plan_resolution(&lock));
                }
            }
            resolutions
        };

        for (event, cleanup) in resolutions {
            self.finish_resolution(event, cleanup).await?;
        }
        Ok(())
    }

    async fn finish_resolution(
        &self,
        event: ResolutionEvent,
        cleanup: Vec<TxnOp>,
    ) -> Result<()> {
        // The cleanup must land; transient store failures get a bounded
        // backoff before surfacing.
        let mut backoff = WATCH_BACKOFF_BASE;
        let mut attempts = 0;
        loop {
            match self.store.txn(vec![], cleanup.clone()).await {
                Ok(_) => break,
                Err(err) if attempts < 3 => {
                    attempts += 1;
                    tracing::warn!(error = %err, attempts, "resolution cleanup failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
                }
                Err(err) => return Err(err.into()),
            }
        }
        counter!(names::LOCKS_RESOLVED_TOTAL).increment(1);
        gauge!(names::ACTIVE_LOCKS).set(locks_gauge(read_state(&self.state).keeper.locks().len()));
        tracing::info!(
            task = %event.task,
            schema = %event.down_schema,
            table = %event.down_table,
            ddls = event.ddls.len(),
            "shard DDL lock resolved"
        );
        for message in messages_for(&event, Utc::now()) {
            match serde_json::to_string(&message) {
                Ok(json) => tracing::debug!(announcement = %json, "ddl announcement"),
                Err(err) => tracing::error!(error = %err, "failed to encode ddl announcement"),
            }
        }
        // No receivers is fine; announcements are best-effort.
        let _ = self.announce.send(event);
        Ok(())
    }
}

/// Plans the store cleanup for a resolved lock and the announcement of
/// the net schema change it applied.
fn plan_resolution(lock: &Lock) -> (ResolutionEvent, Vec<TxnOp>) {
    let mut cleanup = Vec::new();
    for (source, up_schema, up_table) in lock.shard_tables() {
        cleanup.push(TxnOp::Delete {
            key: InfoKey::new(lock.task(), &source, &up_schema, &up_table)
                .as_ref()
                .to_string(),
        });
        cleanup.push(TxnOp::Delete {
            key: OperationKey::new(lock.task(), &source, &up_schema, &up_table)
                .as_ref()
                .to_string(),
        });
    }
    cleanup.push(TxnOp::Delete {
        key: InitSchemaKey::new(lock.task(), lock.down_schema(), lock.down_table())
            .as_ref()
            .to_string(),
    });

    let event = ResolutionEvent {
        task: lock.task().to_string(),
        down_schema: lock.down_schema().to_string(),
        down_table: lock.down_table().to_string(),
        ddls: lock.init_schema().diff(lock.joined()),
    };
    (event, cleanup)
}
