//! Observability metrics for the coordinator.
//!
//! Exposed via the `metrics` crate facade; install any compatible
//! recorder (e.g. a Prometheus exporter) in the embedding process.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `conflux_ddl_events_total` | Counter | `stream` | Watch events dispatched |
//! | `conflux_ddl_operations_total` | Counter | `stage` | Operations written, by conflict stage |
//! | `conflux_ddl_locks_resolved_total` | Counter | - | Locks fully resolved and removed |
//! | `conflux_ddl_active_locks` | Gauge | - | Locks currently held in memory |

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: watch events dispatched to the coordinator.
    pub const EVENTS_TOTAL: &str = "conflux_ddl_events_total";
    /// Counter: operations written, labeled by conflict stage.
    pub const OPERATIONS_TOTAL: &str = "conflux_ddl_operations_total";
    /// Counter: locks fully resolved and removed.
    pub const LOCKS_RESOLVED_TOTAL: &str = "conflux_ddl_locks_resolved_total";
    /// Gauge: locks currently held in memory.
    pub const ACTIVE_LOCKS: &str = "conflux_ddl_active_locks";
}

/// Label keys used across metrics.
pub mod labels {
    /// Watch stream name (`source-tables`, `info`, `operation`).
    pub const STREAM: &str = "stream";
    /// Conflict stage of an emitted operation.
    pub const STAGE: &str = "stage";
}
