//! Canal-flat announcements of resolved schema changes.
//!
//! When a lock resolves, the net schema change that reached the downstream
//! table is published for consumers (message queues, audit sinks) in the
//! Canal flat-message JSON layout, the lingua franca of MySQL change
//! consumers. Only DDL announcements are encoded here; row change
//! transport is outside the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A resolved round of schema change on one downstream table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionEvent {
    /// Replication task name.
    pub task: String,
    /// Downstream schema.
    pub down_schema: String,
    /// Downstream table.
    pub down_table: String,
    /// The net DDLs the round applied (baseline schema → joined schema).
    pub ddls: Vec<String>,
}

/// A Canal flat message describing one DDL.
///
/// Field names follow the Canal `FlatMessage` wire layout so existing
/// consumers decode it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanalFlatMessage {
    /// Batch identifier. Ignored by consumers; always zero.
    pub id: i64,
    /// Schema (database) name.
    #[serde(rename = "database")]
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Whether the message carries a DDL.
    #[serde(rename = "isDdl")]
    pub is_ddl: bool,
    /// Event type (`ALTER`, `CREATE`, ...).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event time, milliseconds since epoch.
    #[serde(rename = "es")]
    pub execution_time: i64,
    /// Message build time, milliseconds since epoch.
    #[serde(rename = "ts")]
    pub build_time: i64,
    /// The DDL statement.
    #[serde(rename = "sql")]
    pub query: String,
}

impl CanalFlatMessage {
    /// Builds a DDL announcement message.
    #[must_use]
    pub fn for_ddl(
        schema: impl Into<String>,
        table: impl Into<String>,
        query: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let query = query.into();
        Self {
            id: 0,
            schema: schema.into(),
            table: table.into(),
            is_ddl: true,
            event_type: ddl_event_type(&query).to_string(),
            execution_time: at.timestamp_millis(),
            build_time: Utc::now().timestamp_millis(),
            query,
        }
    }
}

/// Maps a DDL statement to its Canal event type.
fn ddl_event_type(query: &str) -> &'static str {
    let head = query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match head.as_str() {
        "CREATE" => "CREATE",
        "ALTER" => "ALTER",
        "DROP" => "ERASE",
        "RENAME" => "RENAME",
        "TRUNCATE" => "TRUNCATE",
        _ => "QUERY",
    }
}

/// Encodes one message per DDL of a resolution.
#[must_use]
pub fn messages_for(event: &ResolutionEvent, at: DateTime<Utc>) -> Vec<CanalFlatMessage> {
    event
        .ddls
        .iter()
        .map(|ddl| CanalFlatMessage::for_ddl(&event.down_schema, &event.down_table, ddl, at))
        .collect()
}
