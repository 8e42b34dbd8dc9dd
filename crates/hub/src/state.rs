use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::ingest::IngestReport;
use crate::telemetry::SignalKind;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub devices_connected: usize,
    pub counters: IngestCounters,
    pub latest: HashMap<String, LatestValue>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Default, Serialize)]
pub struct IngestCounters {
    pub messages: u64,
    pub rejected: u64,
    pub failed: u64,
    pub signals: u64,
    pub logs_written: u64,
    pub alerts: u64,
    /// Actuators switched on by threshold automation.
    pub commands: u64,
}

#[derive(Clone, Serialize)]
pub struct LatestValue {
    pub kind: SignalKind,
    pub value: Value,
    pub unit: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub devices_connected: usize,
    pub counters: IngestCounters,
    pub latest: HashMap<String, LatestValue>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            devices_connected: 0,
            counters: IngestCounters::default(),
            latest: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a successfully processed device message.
    pub fn record_report(&mut self, source: &str, report: &IngestReport) {
        let now = OffsetDateTime::now_utc();
        self.counters.messages += 1;
        self.counters.signals += report.outcomes.len() as u64;
        self.counters.logs_written += report.outcomes.iter().filter(|o| o.logged).count() as u64;
        self.counters.alerts += report.alerts.len() as u64;
        self.counters.commands += report.commands.len() as u64;

        let mut readings = Vec::new();
        for o in &report.outcomes {
            self.latest.insert(
                o.name.clone(),
                LatestValue {
                    kind: o.kind,
                    value: o.value.clone(),
                    unit: o.unit.clone(),
                    at: now,
                },
            );

            match o.kind {
                SignalKind::Actuator => {
                    let state_str = if o.value.as_bool() == Some(true) { "ON" } else { "OFF" };
                    self.push_event(EventKind::Actuator, format!("{} set {state_str}", o.name));
                }
                _ => readings.push(format!("{}={}{}", o.name, o.value, o.unit)),
            }
        }

        if !readings.is_empty() {
            self.push_event(EventKind::Reading, format!("{source}: {}", readings.join(", ")));
        }
        for msg in &report.alerts {
            self.push_event(EventKind::Alert, msg.clone());
        }
    }

    /// A message that was dropped because it could not be parsed.
    pub fn record_rejected(&mut self, detail: String) {
        self.counters.rejected += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// A message that was dropped because the store failed.
    pub fn record_failure(&mut self, detail: String) {
        self.counters.failed += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn device_connected(&mut self, peer: &str) {
        self.devices_connected += 1;
        self.push_event(EventKind::System, format!("device connected ({peer})"));
    }

    pub fn device_disconnected(&mut self, peer: &str) {
        self.devices_connected = self.devices_connected.saturating_sub(1);
        self.push_event(EventKind::System, format!("device disconnected ({peer})"));
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            devices_connected: self.devices_connected,
            counters: self.counters.clone(),
            latest: self.latest.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
