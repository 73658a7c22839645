//! End-to-end coordinator tests against the in-memory metadata store.
//!
//! These drive the full loop (agent writes, watch dispatch, operation
//! emission, acknowledgement, resolution cleanup), including coordinator
//! restarts that must rebuild identical state from the store.

use std::sync::Arc;
use std::time::Duration;

use conflux_core::{EventType, MemoryMetaStore, MetaStore, OperationKey, Revision};
use conflux_ddl::coordinator::{Coordinator, DownstreamMeta};
use conflux_ddl::info::{get_all_info, put_info, Info};
use conflux_ddl::init_schema::get_init_schema;
use conflux_ddl::operation::{
    get_all_operations, operation_from_kv, put_operation, ConflictStage, Operation,
};
use conflux_ddl::query::{shard_display, DdlLock, LOCK_MODE_OPTIMISTIC};
use conflux_ddl::schema::{ColumnDef, TableSchema};
use conflux_ddl::topology::{
    delete_source_tables, put_source_tables, put_source_tables_delete_info,
    put_source_tables_info, SourceTables,
};

// ============================================================================
// Helpers
// ============================================================================

fn coordinator() -> Coordinator {
    Coordinator::new(Arc::new(|_: &str| DownstreamMeta::default()))
}

fn as_store(store: &Arc<MemoryMetaStore>) -> Arc<dyn MetaStore> {
    Arc::clone(store) as Arc<dyn MetaStore>
}

async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn table_schema(columns: &[(&str, &str)]) -> TableSchema {
    let mut schema =
        TableSchema::new("bar").with_column(ColumnDef::new("id", "INT").primary_key());
    for (name, ty) in columns {
        schema = schema.with_column(ColumnDef::new(*name, *ty));
    }
    schema
}

#[allow(clippy::too_many_arguments)]
fn new_info(
    task: &str,
    source: &str,
    up_schema: &str,
    up_table: &str,
    down_schema: &str,
    down_table: &str,
    ddls: &[&str],
    pre: &TableSchema,
    posts: &[&TableSchema],
) -> Info {
    Info::new(
        task,
        source,
        up_schema,
        up_table,
        down_schema,
        down_table,
        ddls.iter().map(|d| (*d).to_string()).collect(),
        pre.clone(),
        posts.iter().map(|p| (*p).clone()).collect(),
    )
}

/// Waits for exactly one operation put on the shard's key from the given
/// revision, then verifies no unexpected second operation follows.
async fn watch_exact_one_operation(
    store: &MemoryMetaStore,
    task: &str,
    source: &str,
    up_schema: &str,
    up_table: &str,
    revision: Revision,
) -> Operation {
    let key = OperationKey::new(task, source, up_schema, up_table);
    let mut stream = store.watch(key.as_ref(), revision).await.unwrap();

    let op = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = stream.recv().await.expect("operation watch ended");
            if matches!(event.event_type, EventType::Put) {
                return operation_from_kv(&event.kv).expect("decode operation");
            }
        }
    })
    .await
    .expect("no operation was emitted");

    match tokio::time::timeout(Duration::from_millis(100), stream.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(event)) => panic!("unexpected extra operation event: {event:?}"),
    }
    op
}

/// Acknowledges an operation the way a worker agent does.
async fn ack(store: &MemoryMetaStore, op: &Operation) {
    let mut done = op.clone();
    done.done = true;
    let (_, putted) = put_operation(store, &done, 0).await.unwrap();
    assert!(putted, "acknowledgement must land");
}

fn expected_lock(id: &str, task: &str, synced: Vec<String>, unsynced: Vec<String>) -> DdlLock {
    DdlLock {
        id: id.to_string(),
        task: task.to_string(),
        mode: LOCK_MODE_OPTIMISTIC.to_string(),
        owner: String::new(),
        ddls: None,
        synced,
        unsynced,
    }
}

// ============================================================================
// Registry lifecycle
// ============================================================================

#[tokio::test]
async fn source_tables_lifecycle_and_recovery() {
    let store = Arc::new(MemoryMetaStore::new());
    let (task, source1, source2) = ("task", "mysql-replica-1", "mysql-replica-2");
    let (down_schema, down_table) = ("db", "tbl");

    let mut st1 = SourceTables::new(task, source1);
    st1.add_table("db", "tbl-1", down_schema, down_table);
    st1.add_table("db", "tbl-2", down_schema, down_table);
    let mut st2 = SourceTables::new(task, source2);
    st2.add_table("db", "tbl-1", down_schema, down_table);
    st2.add_table("db", "tbl-2", down_schema, down_table);

    // CASE 1: start without any previous state.
    let o = coordinator();
    o.start(as_store(&store)).await.unwrap();
    assert!(o.find_tables(task, down_schema, down_table).is_empty());
    o.close().await;
    o.close().await; // close multiple times

    // CASE 2: start again; a put is picked up by the watcher.
    o.start(as_store(&store)).await.unwrap();
    assert!(o.find_tables(task, down_schema, down_table).is_empty());
    put_source_tables(store.as_ref(), &st1).await.unwrap();
    assert!(wait_until(|| o.find_tables(task, down_schema, down_table).len() == 1).await);
    let tts = o.find_tables(task, down_schema, down_table);
    assert_eq!(tts[0], st1.target_table(down_schema, down_table));
    o.close().await;

    // CASE 3: start again with previous source tables in the store.
    o.start(as_store(&store)).await.unwrap();
    let tts = o.find_tables(task, down_schema, down_table);
    assert_eq!(tts.len(), 1);
    assert_eq!(tts[0], st1.target_table(down_schema, down_table));

    put_source_tables(store.as_ref(), &st2).await.unwrap();
    assert!(wait_until(|| o.find_tables(task, down_schema, down_table).len() == 2).await);
    let tts = o.find_tables(task, down_schema, down_table);
    assert_eq!(tts[0], st1.target_table(down_schema, down_table));
    assert_eq!(tts[1], st2.target_table(down_schema, down_table));
    o.close().await;

    // CASE 4: a brand new instance recovers the same registry.
    let o = coordinator();
    o.start(as_store(&store)).await.unwrap();
    assert_eq!(o.find_tables(task, down_schema, down_table).len(), 2);

    delete_source_tables(store.as_ref(), &st1).await.unwrap();
    assert!(wait_until(|| o.find_tables(task, down_schema, down_table).len() == 1).await);
    let tts = o.find_tables(task, down_schema, down_table);
    assert_eq!(tts[0], st2.target_table(down_schema, down_table));
    o.close().await;
}

#[tokio::test]
async fn close_before_start_is_a_noop() {
    let o = coordinator();
    o.close().await;
    o.close().await;
}

// ============================================================================
// Full coordination flow, with restart variants
// ============================================================================

#[derive(Clone, Copy)]
enum Restart {
    No,
    SameInstance,
    NewInstance,
}

async fn rebuild(o: Coordinator, store: &Arc<MemoryMetaStore>, restart: Restart) -> Coordinator {
    match restart {
        Restart::No => o,
        Restart::SameInstance => {
            o.close().await;
            o.start(as_store(store)).await.unwrap();
            o
        }
        Restart::NewInstance => {
            o.close().await;
            let fresh = coordinator();
            fresh.start(as_store(store)).await.unwrap();
            fresh
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_optimist_flow(restart: Restart) {
    let store = Arc::new(MemoryMetaStore::new());
    let task = "task-test-optimist";
    let (source1, source2) = ("mysql-replica-1", "mysql-replica-2");
    let (down_schema, down_table) = ("foo", "bar");
    let lock_id = format!("{task}-`{down_schema}`.`{down_table}`");

    let ddls1 = ["ALTER TABLE bar ADD COLUMN c1 INT"];
    let ddls2 = ["ALTER TABLE bar ADD COLUMN c2 INT"];
    let ddls3 = ["ALTER TABLE bar DROP COLUMN c2"];
    let create3 = ["CREATE TABLE bar (id INT PRIMARY KEY, c1 INT, c2 INT)"];
    let ti0 = table_schema(&[]);
    let ti1 = table_schema(&[("c1", "INT")]);
    let ti2 = table_schema(&[("c1", "INT"), ("c2", "INT")]);
    let ti3 = ti1.clone();

    let i11 = new_info(task, source1, "foo", "bar-1", down_schema, down_table, &ddls1, &ti0, &[&ti1]);
    let i12 = new_info(task, source1, "foo", "bar-2", down_schema, down_table, &ddls1, &ti0, &[&ti1]);
    let i21 = new_info(task, source1, "foo", "bar-1", down_schema, down_table, &ddls2, &ti1, &[&ti2]);
    let i23 = new_info(task, source2, "foo-2", "bar-3", down_schema, down_table, &create3, &ti2, &[&ti2]);
    let i31 = new_info(task, source1, "foo", "bar-1", down_schema, down_table, &ddls3, &ti2, &[&ti3]);
    let i33 = new_info(task, source2, "foo-2", "bar-3", down_schema, down_table, &ddls3, &ti2, &[&ti3]);

    let mut st1 = SourceTables::new(task, source1);
    st1.add_table("foo", "bar-1", down_schema, down_table);
    st1.add_table("foo", "bar-2", down_schema, down_table);
    let mut st31 = SourceTables::new(task, source1);
    st31.add_table("foo", "bar-1", down_schema, down_table);
    let mut st32 = SourceTables::new(task, source2);
    st32.add_table("foo-2", "bar-3", down_schema, down_table);

    put_source_tables(store.as_ref(), &st1).await.unwrap();

    // CASE 1: start without any previous shard DDL info.
    let o = coordinator();
    o.start(as_store(&store)).await.unwrap();
    assert!(o.locks().is_empty());
    o.close().await;
    o.close().await;

    // CASE 2: start again without any previous shard DDL info.
    o.start(as_store(&store)).await.unwrap();
    assert!(o.locks().is_empty());

    // PUT i11: creates the lock, not yet synced.
    let rev1 = put_info(store.as_ref(), &i11).await.unwrap();
    assert!(wait_until(|| o.locks().len() == 1).await);
    assert!(o.locks().contains_key(&lock_id));
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(!synced);
    assert_eq!(remain, 1);

    let expected = vec![expected_lock(
        &lock_id,
        task,
        vec![shard_display(source1, "foo", "bar-1")],
        vec![shard_display(source1, "foo", "bar-2")],
    )];
    assert_eq!(o.show_locks("", &[]), expected);

    // The operation for i11 carries its DDLs.
    let op11 = watch_exact_one_operation(&store, task, source1, "foo", "bar-1", rev1).await;
    assert_eq!(op11.ddls, ddls1);
    assert_eq!(op11.conflict_stage, ConflictStage::None);
    assert_eq!(o.show_locks("", &[]), expected);

    // Acknowledge op11; the lock remembers it.
    ack(&store, &op11).await;
    assert!(
        wait_until(|| o
            .locks()
            .get(&lock_id)
            .is_some_and(|l| l.is_done(source1, "foo", "bar-1")))
        .await
    );
    assert!(!o.locks()[&lock_id].is_done(source1, "foo", "bar-2"));
    assert_eq!(o.show_locks("", &[]), expected);

    // PUT i12: the lock becomes synced.
    let rev2 = put_info(store.as_ref(), &i12).await.unwrap();
    assert!(wait_until(|| o.locks().get(&lock_id).is_some_and(|l| l.is_synced().0)).await);
    let expected = vec![expected_lock(
        &lock_id,
        task,
        vec![
            shard_display(source1, "foo", "bar-1"),
            shard_display(source1, "foo", "bar-2"),
        ],
        vec![],
    )];
    assert_eq!(o.show_locks("", &[]), expected);

    let op12 = watch_exact_one_operation(&store, task, source1, "foo", "bar-2", rev2).await;
    assert_eq!(op12.ddls, ddls1);
    assert_eq!(op12.conflict_stage, ConflictStage::None);

    // Acknowledge op12: the lock resolves and every key is cleaned up.
    ack(&store, &op12).await;
    assert!(wait_until(|| o.locks().is_empty()).await);
    assert!(o.show_locks("", &[]).is_empty());
    let mut cleaned = false;
    for _ in 0..100 {
        let (infos, _) = get_all_info(store.as_ref()).await.unwrap();
        let (ops, _) = get_all_operations(store.as_ref()).await.unwrap();
        if infos.is_empty() && ops.is_empty() {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "resolution left info/operation keys behind");

    // A second round on the same target.
    let rev1 = put_info(store.as_ref(), &i21).await.unwrap();
    assert!(wait_until(|| o.locks().len() == 1).await);
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(!synced);
    assert_eq!(remain, 1);
    let op21 = watch_exact_one_operation(&store, task, source1, "foo", "bar-1", rev1).await;
    assert_eq!(op21.ddls, ddls2);
    assert_eq!(op21.conflict_stage, ConflictStage::None);

    // CASE 3: restart with an un-synced lock in the store.
    let o = rebuild(o, &store, restart).await;
    assert_eq!(o.locks().len(), 1);
    assert!(o.locks().contains_key(&lock_id));
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(!synced);
    assert_eq!(remain, 1);

    // A new table appears mid-lock (CREATE TABLE), atomically with its
    // report: the lock gains the shard.
    let rev3 = put_source_tables_info(store.as_ref(), &st32, &i23).await.unwrap();
    assert!(
        wait_until(|| {
            o.locks().get(&lock_id).is_some_and(|l| {
                l.ready()
                    .get(source2)
                    .and_then(|s| s.get("foo-2"))
                    .and_then(|t| t.get("bar-3"))
                    .copied()
                    .unwrap_or(false)
            })
        })
        .await
    );
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(!synced);
    assert_eq!(remain, 1);
    let tts = o.find_tables(task, down_schema, down_table);
    assert_eq!(tts.len(), 2);
    assert_eq!(tts[1].source, source2);
    assert!(tts[1].contains("foo-2", "bar-3"));

    let expected = vec![expected_lock(
        &lock_id,
        task,
        vec![
            shard_display(source1, "foo", "bar-1"),
            shard_display(source2, "foo-2", "bar-3"),
        ],
        vec![shard_display(source1, "foo", "bar-2")],
    )];
    assert_eq!(o.show_locks("", &[]), expected);
    assert_eq!(o.show_locks(task, &[]), expected);
    assert_eq!(o.show_locks("", &[source1.to_string()]), expected);
    assert_eq!(o.show_locks("", &[source2.to_string()]), expected);
    assert_eq!(
        o.show_locks("", &[source1.to_string(), source2.to_string()]),
        expected
    );
    assert_eq!(
        o.show_locks(task, &[source1.to_string(), source2.to_string()]),
        expected
    );
    assert!(o.show_locks("not-exist", &[]).is_empty());
    assert!(o.show_locks("", &["not-exist".to_string()]).is_empty());

    let op23 = watch_exact_one_operation(&store, task, source2, "foo-2", "bar-3", rev3).await;
    assert_eq!(op23.ddls, create3);
    assert_eq!(op23.conflict_stage, ConflictStage::None);

    // Drop a table (DROP TABLE path): report first, then the atomic
    // source-tables rewrite + info delete. The departed shard counts as
    // synced by absence.
    let rev2 = put_info(store.as_ref(), &i12).await.unwrap();
    watch_exact_one_operation(&store, task, source1, "foo", "bar-2", rev2).await;
    put_source_tables_delete_info(store.as_ref(), &st31, &i12).await.unwrap();
    assert!(
        wait_until(|| o
            .locks()
            .get(&lock_id)
            .is_some_and(|l| !l.has_shard(source1, "foo", "bar-2")))
        .await
    );
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(synced);
    assert_eq!(remain, 0);
    let tts = o.find_tables(task, down_schema, down_table);
    assert_eq!(tts.len(), 2);
    assert_eq!(tts[0].source, source1);
    assert!(tts[0].contains("foo", "bar-1"));
    assert!(!tts[0].contains("foo", "bar-2"));
    assert_eq!(tts[1].source, source2);
    assert!(!o.locks()[&lock_id].is_resolved());
    assert!(!o.locks()[&lock_id].is_done(source1, "foo", "bar-1"));
    assert!(!o.locks()[&lock_id].is_done(source2, "foo-2", "bar-3"));

    // CASE 4: restart with a synced lock and non-done operations. The
    // operations are NOT re-emitted; the acknowledgement state is empty.
    let o = rebuild(o, &store, restart).await;
    assert_eq!(o.locks().len(), 1);
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(synced);
    assert_eq!(remain, 0);
    assert!(!o.locks()[&lock_id].is_done(source1, "foo", "bar-1"));
    assert!(!o.locks()[&lock_id].is_done(source2, "foo-2", "bar-3"));

    // Acknowledge op21.
    ack(&store, &op21).await;
    assert!(
        wait_until(|| o
            .locks()
            .get(&lock_id)
            .is_some_and(|l| l.is_done(source1, "foo", "bar-1")))
        .await
    );

    // CASE 5: restart with a done operation; the acknowledgement survives.
    let o = rebuild(o, &store, restart).await;
    assert_eq!(o.locks().len(), 1);
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(synced);
    assert_eq!(remain, 0);
    assert!(o.locks()[&lock_id].is_done(source1, "foo", "bar-1"));
    assert!(!o.locks()[&lock_id].is_done(source2, "foo-2", "bar-3"));

    // Acknowledge op23: the lock resolves.
    ack(&store, &op23).await;
    assert!(wait_until(|| o.locks().is_empty()).await);
    let mut cleaned = false;
    for _ in 0..100 {
        let (infos, _) = get_all_info(store.as_ref()).await.unwrap();
        if infos.is_empty() {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "resolution left info keys behind");

    // DROP COLUMN round: the initiator has nothing to run downstream and
    // counts as un-synced until everyone drops.
    let rev1 = put_info(store.as_ref(), &i31).await.unwrap();
    assert!(wait_until(|| o.locks().len() == 1).await);
    let (synced, remain) = o.locks()[&lock_id].is_synced();
    assert!(!synced);
    assert_eq!(remain, 1);

    let expected = vec![expected_lock(
        &lock_id,
        task,
        // Un-dropped shards equal the joined schema and are synced.
        vec![shard_display(source2, "foo-2", "bar-3")],
        // The shard that dropped diverges from the joined schema.
        vec![shard_display(source1, "foo", "bar-1")],
    )];
    assert_eq!(o.show_locks("", &[]), expected);

    let op31 = watch_exact_one_operation(&store, task, source1, "foo", "bar-1", rev1).await;
    assert!(op31.ddls.is_empty());
    assert_eq!(op31.conflict_stage, ConflictStage::None);
    assert_eq!(o.show_locks("", &[]), expected);

    ack(&store, &op31).await;
    assert!(
        wait_until(|| o
            .locks()
            .get(&lock_id)
            .is_some_and(|l| l.is_done(source1, "foo", "bar-1")))
        .await
    );
    assert_eq!(o.show_locks("", &[]), expected);

    // The last shard drops: the lock syncs and the drop is emitted.
    let rev3 = put_info(store.as_ref(), &i33).await.unwrap();
    assert!(wait_until(|| o.locks().get(&lock_id).is_some_and(|l| l.is_synced().0)).await);
    let expected = vec![expected_lock(
        &lock_id,
        task,
        vec![
            shard_display(source1, "foo", "bar-1"),
            shard_display(source2, "foo-2", "bar-3"),
        ],
        vec![],
    )];
    assert_eq!(o.show_locks("", &[]), expected);

    let op33 = watch_exact_one_operation(&store, task, source2, "foo-2", "bar-3", rev3).await;
    assert_eq!(op33.ddls, ddls3);
    assert_eq!(op33.conflict_stage, ConflictStage::None);

    ack(&store, &op33).await;
    assert!(wait_until(|| o.locks().is_empty()).await);
    assert!(o.show_locks("", &[]).is_empty());

    // CASE 6: restart after everything resolved.
    let o = rebuild(o, &store, restart).await;
    assert!(o.locks().is_empty());
    o.close().await;
}

#[tokio::test]
async fn optimist_flow_without_restart() {
    run_optimist_flow(Restart::No).await;
}

#[tokio::test]
async fn optimist_flow_with_restart() {
    run_optimist_flow(Restart::SameInstance).await;
}

#[tokio::test]
async fn optimist_flow_with_new_instance() {
    run_optimist_flow(Restart::NewInstance).await;
}

// ============================================================================
// Conflict detection
// ============================================================================

#[tokio::test]
async fn conflicting_shard_is_halted_and_can_replace() {
    let store = Arc::new(MemoryMetaStore::new());
    let task = "task-test-optimist";
    let source1 = "mysql-replica-1";
    let (down_schema, down_table) = ("foo", "bar");

    let ddls1 = ["ALTER TABLE bar ADD COLUMN c1 TEXT"];
    let ddls2 = ["ALTER TABLE bar ADD COLUMN c1 DATETIME"];
    let ti0 = table_schema(&[]);
    let ti1 = table_schema(&[("c1", "TEXT")]);
    let ti2 = table_schema(&[("c1", "DATETIME")]);
    let ti3 = ti0.clone();

    let i1 = new_info(task, source1, "foo", "bar-1", down_schema, down_table, &ddls1, &ti0, &[&ti1]);
    let i2 = new_info(task, source1, "foo", "bar-2", down_schema, down_table, &ddls2, &ti0, &[&ti2]);
    let i3 = new_info(task, source1, "foo", "bar-2", down_schema, down_table, &ddls1, &ti0, &[&ti3]);

    let mut st1 = SourceTables::new(task, source1);
    st1.add_table("foo", "bar-1", down_schema, down_table);
    st1.add_table("foo", "bar-2", down_schema, down_table);
    put_source_tables(store.as_ref(), &st1).await.unwrap();

    let o = coordinator();
    o.start(as_store(&store)).await.unwrap();
    assert!(o.locks().is_empty());

    // First shard introduces c1 TEXT.
    let rev1 = put_info(store.as_ref(), &i1).await.unwrap();
    let op1 = watch_exact_one_operation(&store, task, source1, "foo", "bar-1", rev1).await;
    assert_eq!(op1.ddls, ddls1);
    assert_eq!(op1.conflict_stage, ConflictStage::None);

    // Second shard disagrees on the type: conflict detected, no DDLs.
    let rev2 = put_info(store.as_ref(), &i2).await.unwrap();
    let op2 = watch_exact_one_operation(&store, task, source1, "foo", "bar-2", rev2).await;
    assert!(op2.ddls.is_empty());
    assert_eq!(op2.conflict_stage, ConflictStage::Detected);

    // A replacement report compatible with the joined schema clears the
    // conflict; nothing is left for the shard to run.
    let rev3 = put_info(store.as_ref(), &i3).await.unwrap();
    let op3 = watch_exact_one_operation(&store, task, source1, "foo", "bar-2", rev3).await;
    assert!(op3.ddls.is_empty());
    assert_eq!(op3.conflict_stage, ConflictStage::None);

    o.close().await;
}

// ============================================================================
// Multiple downstream targets
// ============================================================================

#[tokio::test]
async fn locks_on_distinct_targets_are_independent() {
    let store = Arc::new(MemoryMetaStore::new());
    let task = "test-optimist-lock-multiple-target";
    let source = "mysql-replica-1";
    let up_schema = "foo";
    let (down_schema, down_table1, down_table2) = ("foo", "bar", "rab");
    let lock_id1 = format!("{task}-`{down_schema}`.`{down_table1}`");
    let lock_id2 = format!("{task}-`{down_schema}`.`{down_table2}`");

    let ddls = ["ALTER TABLE bar ADD COLUMN c1 TEXT"];
    let ti0 = table_schema(&[]);
    let ti1 = table_schema(&[("c1", "TEXT")]);

    let i11 = new_info(task, source, up_schema, "bar-1", down_schema, down_table1, &ddls, &ti0, &[&ti1]);
    let i12 = new_info(task, source, up_schema, "bar-2", down_schema, down_table1, &ddls, &ti0, &[&ti1]);
    let i21 = new_info(task, source, up_schema, "bar-3", down_schema, down_table2, &ddls, &ti0, &[&ti1]);
    let i22 = new_info(task, source, up_schema, "bar-4", down_schema, down_table2, &ddls, &ti0, &[&ti1]);

    let mut sts = SourceTables::new(task, source);
    sts.add_table(up_schema, "bar-1", down_schema, down_table1);
    sts.add_table(up_schema, "bar-2", down_schema, down_table1);
    sts.add_table(up_schema, "bar-3", down_schema, down_table2);
    sts.add_table(up_schema, "bar-4", down_schema, down_table2);
    put_source_tables(store.as_ref(), &sts).await.unwrap();

    let o = coordinator();
    o.start(as_store(&store)).await.unwrap();
    assert!(o.locks().is_empty());

    // One report per target: two independent locks.
    put_info(store.as_ref(), &i11).await.unwrap();
    put_info(store.as_ref(), &i21).await.unwrap();
    assert!(wait_until(|| o.locks().len() == 2).await);
    assert!(o.locks().contains_key(&lock_id1));
    assert!(o.locks().contains_key(&lock_id2));

    // ShowLocks returns both, ordered by lock ID.
    let locks = o.show_locks("", &[]);
    assert_eq!(
        locks,
        vec![
            expected_lock(
                &lock_id1,
                task,
                vec![shard_display(source, up_schema, "bar-1")],
                vec![shard_display(source, up_schema, "bar-2")],
            ),
            expected_lock(
                &lock_id2,
                task,
                vec![shard_display(source, up_schema, "bar-3")],
                vec![shard_display(source, up_schema, "bar-4")],
            ),
        ]
    );

    // Sync both locks.
    let rev1 = put_info(store.as_ref(), &i12).await.unwrap();
    let rev2 = put_info(store.as_ref(), &i22).await.unwrap();
    assert!(
        wait_until(|| {
            let locks = o.locks();
            locks.get(&lock_id1).is_some_and(|l| l.is_synced().0)
                && locks.get(&lock_id2).is_some_and(|l| l.is_synced().0)
        })
        .await
    );

    let op12 = watch_exact_one_operation(&store, task, source, up_schema, "bar-2", rev1).await;
    assert_eq!(op12.ddls, ddls);
    assert_eq!(op12.conflict_stage, ConflictStage::None);

    // Resolving the first lock leaves the second untouched.
    let mut op11 = op12.clone();
    op11.up_table = "bar-1".to_string();
    ack(&store, &op11).await;
    ack(&store, &op12).await;
    assert!(wait_until(|| !o.locks().contains_key(&lock_id1)).await);
    assert_eq!(o.locks().len(), 1);
    let remaining = o.show_locks("", &[]);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, lock_id2);
    assert_eq!(
        remaining[0].synced,
        vec![
            shard_display(source, up_schema, "bar-3"),
            shard_display(source, up_schema, "bar-4"),
        ]
    );

    let op22 = watch_exact_one_operation(&store, task, source, up_schema, "bar-4", rev2).await;
    let mut op21 = op22.clone();
    op21.up_table = "bar-3".to_string();
    ack(&store, &op21).await;
    ack(&store, &op22).await;
    assert!(wait_until(|| o.locks().is_empty()).await);
    assert!(o.show_locks("", &[]).is_empty());

    o.close().await;
}

// ============================================================================
// Init schema lifecycle
// ============================================================================

#[tokio::test]
async fn init_schema_is_persisted_and_cleaned_up() {
    let store = Arc::new(MemoryMetaStore::new());
    let task = "test-optimist-init-schema";
    let source = "mysql-replica-1";
    let up_schema = "foo";
    let (down_schema, down_table) = ("foo", "bar");

    let ddls1 = ["ALTER TABLE bar ADD COLUMN c1 TEXT"];
    let ddls2 = ["ALTER TABLE bar ADD COLUMN c2 INT"];
    let ti0 = table_schema(&[]);
    let ti1 = table_schema(&[("c1", "TEXT")]);
    let ti2 = table_schema(&[("c1", "TEXT"), ("c2", "INT")]);

    let i11 = new_info(task, source, up_schema, "bar-1", down_schema, down_table, &ddls1, &ti0, &[&ti1]);
    let i12 = new_info(task, source, up_schema, "bar-2", down_schema, down_table, &ddls1, &ti0, &[&ti1]);
    let i21 = new_info(task, source, up_schema, "bar-1", down_schema, down_table, &ddls2, &ti1, &[&ti2]);

    let mut st = SourceTables::new(task, source);
    st.add_table(up_schema, "bar-1", down_schema, down_table);
    st.add_table(up_schema, "bar-2", down_schema, down_table);
    put_source_tables(store.as_ref(), &st).await.unwrap();

    let o = coordinator();
    o.start(as_store(&store)).await.unwrap();

    // The first report persists its pre-schema as the lock's baseline.
    put_info(store.as_ref(), &i11).await.unwrap();
    assert!(wait_until(|| o.locks().len() == 1).await);
    let stored = wait_for_init_schema(&store, task, down_schema, down_table)
        .await
        .expect("baseline schema was not persisted");
    assert_eq!(stored, ti0);

    // Resolve the round; the baseline is deleted with the lock.
    let rev1 = put_info(store.as_ref(), &i12).await.unwrap();
    let op12 = watch_exact_one_operation(&store, task, source, up_schema, "bar-2", rev1).await;
    assert_eq!(op12.ddls, ddls1);
    let mut op11 = op12.clone();
    op11.up_table = "bar-1".to_string();
    ack(&store, &op11).await;
    ack(&store, &op12).await;
    assert!(wait_until(|| o.locks().is_empty()).await);
    let mut gone = false;
    for _ in 0..100 {
        if get_init_schema(store.as_ref(), task, down_schema, down_table)
            .await
            .unwrap()
            .is_none()
        {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "baseline schema should be deleted with the lock");

    // The next round persists a fresh baseline.
    put_info(store.as_ref(), &i21).await.unwrap();
    assert!(wait_until(|| o.locks().len() == 1).await);
    let stored = wait_for_init_schema(&store, task, down_schema, down_table)
        .await
        .expect("fresh baseline schema was not persisted");
    assert_eq!(stored, ti1);

    o.close().await;
}

/// Polls the store until the target's baseline schema appears.
async fn wait_for_init_schema(
    store: &MemoryMetaStore,
    task: &str,
    down_schema: &str,
    down_table: &str,
) -> Option<TableSchema> {
    for _ in 0..100 {
        if let Some(schema) = get_init_schema(store, task, down_schema, down_table)
            .await
            .unwrap()
        {
            return Some(schema);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}
