//! # conflux-ddl
//!
//! The optimistic shard-DDL coordination engine for Conflux.
//!
//! Many upstream sharded tables replicate into one downstream table, and
//! each shard may issue schema changes independently. This crate merges
//! those changes optimistically: every shard's reported schema is joined
//! into a single target schema, each shard receives the DDL it must apply
//! to converge, and incompatible changes are detected and reported instead
//! of silently breaking replication.
//!
//! ## Core Concepts
//!
//! - **Info**: a shard's report of a DDL it has just seen, with the schema
//!   before and after
//! - **Operation**: the coordinator's reply telling the shard which DDLs to
//!   run (or that a conflict was detected)
//! - **Lock**: per downstream table, the record of which shards have
//!   reported and acknowledged the current round of schema change
//! - **Joined schema**: the least schema that is a superset of all current
//!   per-shard schemas in the column lattice
//!
//! All state is persisted in a revisioned metadata store
//! ([`conflux_core::MetaStore`]); the [`coordinator::Coordinator`] rebuilds
//! its in-memory model from a snapshot on startup and then follows watch
//! streams, so a restarted coordinator is indistinguishable from one that
//! observed every event live.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admin;
pub mod announce;
pub mod coordinator;
pub mod error;
pub mod info;
pub mod init_schema;
pub mod lock;
pub mod metrics;
pub mod operation;
pub mod query;
pub mod registry;
pub mod schema;
pub mod topology;

pub use announce::{CanalFlatMessage, ResolutionEvent};
pub use coordinator::{Coordinator, DownstreamConfig, DownstreamMeta};
pub use error::{DdlError, Result};
pub use info::Info;
pub use lock::{Lock, LockKeeper};
pub use operation::{ConflictStage, Operation};
pub use query::DdlLock;
pub use registry::TableRegistry;
pub use schema::{ColumnDef, SchemaConflict, TableSchema};
pub use topology::{SourceTables, TargetTable};
