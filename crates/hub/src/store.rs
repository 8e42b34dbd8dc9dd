//! Persistence contract consumed by the ingest pipeline.
//!
//! Entity creation and log admission are single atomic operations on the
//! store side; callers never do a read followed by an unguarded write on a
//! shared key.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::alerts::Direction;
use crate::telemetry::SignalKind;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub kind: SignalKind,
    pub value: Value,
    pub unit: String,
    pub last_log_ts: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub entity_id: i64,
    pub name: String,
    pub value: Value,
    pub kind: SignalKind,
    pub unit: String,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: i64,
    pub entity_id: i64,
    pub name: String,
    pub value: f64,
    pub threshold: f64,
    pub direction: Direction,
    pub message: String,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct NewEntity<'a> {
    pub name: &'a str,
    pub kind: SignalKind,
    pub value: &'a Value,
    pub unit: &'a str,
    pub now: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct NewLog<'a> {
    pub entity_id: i64,
    pub name: &'a str,
    pub value: &'a Value,
    pub kind: SignalKind,
    pub unit: &'a str,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct NewAlert<'a> {
    pub entity_id: i64,
    pub name: &'a str,
    pub value: f64,
    pub threshold: f64,
    pub direction: Direction,
    pub message: &'a str,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>>;

    /// Insert the entity unless one with the same name exists. Returns the
    /// stored entity and whether this call created it.
    async fn create_entity_if_absent(&self, entity: &NewEntity<'_>) -> Result<(Entity, bool)>;

    /// Returns false when no entity has this id (deleted behind our back).
    async fn update_entity_value(&self, id: i64, value: &Value, unit: &str, now: i64) -> Result<bool>;

    /// Append `log` only if fewer than `max_logs` entries for the same entity
    /// have `ts > window_start`. Check and insert are one atomic step; on
    /// success the entity's `last_log_ts` is set to `log.ts`.
    async fn try_append_log(&self, log: &NewLog<'_>, window_start: i64, max_logs: u32) -> Result<bool>;

    /// Logs for `entity_id` with `ts > since`; only tests audit the window.
    #[cfg(test)]
    async fn count_recent_logs(&self, entity_id: i64, since: i64) -> Result<i64>;

    async fn insert_alert(&self, alert: &NewAlert<'_>) -> Result<i64>;
}
