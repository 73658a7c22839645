//! Typed keys for the coordination keyspace.
//!
//! This module provides strongly-typed keys that encode the persisted key
//! families at the type level. Each key type corresponds to one record kind
//! with specific ownership semantics.
//!
//! # Key Families
//!
//! | Key Type | Path | Who Writes |
//! |----------|------|------------|
//! | `SourceTablesKey` | `conflux/ddl/source-tables/{task}/{source}` | Agents |
//! | `InfoKey` | `conflux/ddl/info/{task}/{source}/{upSchema}/{upTable}` | Agents |
//! | `OperationKey` | `conflux/ddl/operation/{task}/{source}/{upSchema}/{upTable}` | Coordinator (Done=false), Agents (Done=true) |
//! | `InitSchemaKey` | `conflux/ddl/init-schema/{task}/{downSchema}/{downTable}` | Coordinator |
//!
//! Field values are escaped so that schema or table names containing `/`
//! cannot collide with the path structure; `parse` reverses the escaping.
//!
//! # Example
//!
//! ```rust
//! use conflux_core::keys::InfoKey;
//!
//! let key = InfoKey::new("task", "mysql-replica-1", "foo", "bar-1");
//! assert_eq!(
//!     key.as_ref(),
//!     "conflux/ddl/info/task/mysql-replica-1/foo/bar-1"
//! );
//! let (task, source, schema, table) = InfoKey::parse(key.as_ref()).unwrap();
//! assert_eq!(table, "bar-1");
//! ```

/// Root prefix of every Conflux coordination key.
pub const KEYSPACE_PREFIX: &str = "conflux/ddl";

/// A typed storage key that encodes path structure.
pub trait MetaKey: AsRef<str> {
    /// Returns the underlying key string.
    fn path(&self) -> &str {
        self.as_ref()
    }
}

/// Escapes one path segment (`%` and `/` only).
fn encode_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

/// Reverses [`encode_segment`].
fn decode_segment(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

macro_rules! impl_key_traits {
    ($ty:ident) => {
        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl MetaKey for $ty {}

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Splits `key` under `prefix` into exactly `n` decoded segments.
fn parse_segments(key: &str, prefix: &str, n: usize) -> Option<Vec<String>> {
    let rest = key.strip_prefix(prefix)?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() != n || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts.into_iter().map(decode_segment).collect())
}

// ============================================================================
// SourceTablesKey
// ============================================================================

/// Key for a per-`(task, source)` upstream table declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceTablesKey(String);

impl SourceTablesKey {
    /// Creates the key for one task and source.
    #[must_use]
    pub fn new(task: &str, source: &str) -> Self {
        Self(format!(
            "{}/{}/{}",
            Self::family_prefix(),
            encode_segment(task),
            encode_segment(source)
        ))
    }

    /// Returns the family prefix without a trailing slash.
    fn family_prefix() -> String {
        format!("{KEYSPACE_PREFIX}/source-tables")
    }

    /// Returns the watch/list prefix for the whole family.
    #[must_use]
    pub fn prefix() -> String {
        format!("{}/", Self::family_prefix())
    }

    /// Returns the list prefix for one task.
    #[must_use]
    pub fn task_prefix(task: &str) -> String {
        format!("{}/{}/", Self::family_prefix(), encode_segment(task))
    }

    /// Parses a key back into `(task, source)`.
    #[must_use]
    pub fn parse(key: &str) -> Option<(String, String)> {
        let mut parts = parse_segments(key, &Self::prefix(), 2)?;
        let source = parts.pop()?;
        let task = parts.pop()?;
        Some((task, source))
    }
}

impl_key_traits!(SourceTablesKey);

// ============================================================================
// InfoKey
// ============================================================================

/// Key for a shard's latest unresolved DDL report.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InfoKey(String);

impl InfoKey {
    /// Creates the key for one shard.
    #[must_use]
    pub fn new(task: &str, source: &str, up_schema: &str, up_table: &str) -> Self {
        Self(shard_key("info", task, source, up_schema, up_table))
    }

    /// Returns the watch/list prefix for the whole family.
    #[must_use]
    pub fn prefix() -> String {
        format!("{KEYSPACE_PREFIX}/info/")
    }

    /// Returns the list prefix for one task.
    #[must_use]
    pub fn task_prefix(task: &str) -> String {
        format!("{}{}/", Self::prefix(), encode_segment(task))
    }

    /// Parses a key back into `(task, source, upSchema, upTable)`.
    #[must_use]
    pub fn parse(key: &str) -> Option<(String, String, String, String)> {
        parse_shard_key(key, &Self::prefix())
    }
}

impl_key_traits!(InfoKey);

// ============================================================================
// OperationKey
// ============================================================================

/// Key for the coordinator's current instruction to a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey(String);

impl OperationKey {
    /// Creates the key for one shard.
    #[must_use]
    pub fn new(task: &str, source: &str, up_schema: &str, up_table: &str) -> Self {
        Self(shard_key("operation", task, source, up_schema, up_table))
    }

    /// Returns the watch/list prefix for the whole family.
    #[must_use]
    pub fn prefix() -> String {
        format!("{KEYSPACE_PREFIX}/operation/")
    }

    /// Returns the list prefix for one task.
    #[must_use]
    pub fn task_prefix(task: &str) -> String {
        format!("{}{}/", Self::prefix(), encode_segment(task))
    }

    /// Parses a key back into `(task, source, upSchema, upTable)`.
    #[must_use]
    pub fn parse(key: &str) -> Option<(String, String, String, String)> {
        parse_shard_key(key, &Self::prefix())
    }
}

impl_key_traits!(OperationKey);

// ============================================================================
// InitSchemaKey
// ============================================================================

/// Key for the first-seen schema of a downstream target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitSchemaKey(String);

impl InitSchemaKey {
    /// Creates the key for one downstream target.
    #[must_use]
    pub fn new(task: &str, down_schema: &str, down_table: &str) -> Self {
        Self(format!(
            "{KEYSPACE_PREFIX}/init-schema/{}/{}/{}",
            encode_segment(task),
            encode_segment(down_schema),
            encode_segment(down_table)
        ))
    }

    /// Returns the watch/list prefix for the whole family.
    #[must_use]
    pub fn prefix() -> String {
        format!("{KEYSPACE_PREFIX}/init-schema/")
    }

    /// Returns the list prefix for one task.
    #[must_use]
    pub fn task_prefix(task: &str) -> String {
        format!("{}{}/", Self::prefix(), encode_segment(task))
    }

    /// Parses a key back into `(task, downSchema, downTable)`.
    #[must_use]
    pub fn parse(key: &str) -> Option<(String, String, String)> {
        let mut parts = parse_segments(key, &Self::prefix(), 3)?;
        let table = parts.pop()?;
        let schema = parts.pop()?;
        let task = parts.pop()?;
        Some((task, schema, table))
    }
}

impl_key_traits!(InitSchemaKey);

fn shard_key(family: &str, task: &str, source: &str, up_schema: &str, up_table: &str) -> String {
    format!(
        "{KEYSPACE_PREFIX}/{family}/{}/{}/{}/{}",
        encode_segment(task),
        encode_segment(source),
        encode_segment(up_schema),
        encode_segment(up_table)
    )
}

fn parse_shard_key(key: &str, prefix: &str) -> Option<(String, String, String, String)> {
    let mut parts = parse_segments(key, prefix, 4)?;
    let table = parts.pop()?;
    let schema = parts.pop()?;
    let source = parts.pop()?;
    let task = parts.pop()?;
    Some((task, source, schema, table))
}
