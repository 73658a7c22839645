//! # conflux-core
//!
//! Core abstractions for the Conflux multi-source replication coordinator.
//!
//! This crate provides the foundational types shared by all Conflux
//! components:
//!
//! - **Metadata Store**: A revisioned, watch-capable key-value store
//!   contract plus an in-memory backend for tests
//! - **Typed Keys**: Strongly-typed key families for the coordination
//!   keyspace
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Structured logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `conflux-core` is the **only** crate allowed to define shared
//! primitives. Domain logic (schema joining, lock lifecycle, the
//! coordinator loop) lives in `conflux-ddl` and interacts with the store
//! exclusively through the contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use conflux_core::prelude::*;
//!
//! // Construct a typed key for a shard's DDL report.
//! let key = InfoKey::new("task", "mysql-replica-1", "foo", "bar-1");
//! assert!(key.as_ref().starts_with("conflux/ddl/info/"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod observability;
pub mod store;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use conflux_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::keys::{InfoKey, InitSchemaKey, MetaKey, OperationKey, SourceTablesKey};
    pub use crate::store::{
        EventType, KeyValue, MemoryMetaStore, MetaStore, PutResult, Revision, TxnCond, TxnOp,
        TxnResult, WatchEvent, WatchStream,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use keys::{InfoKey, InitSchemaKey, MetaKey, OperationKey, SourceTablesKey};
pub use observability::{init_logging, LogFormat};
pub use store::{
    EventType, KeyValue, MemoryMetaStore, MetaStore, PutResult, Revision, TxnCond, TxnOp,
    TxnResult, WatchEvent, WatchStream,
};
