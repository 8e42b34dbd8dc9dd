//! The ingest pipeline: one device message in, current values upserted,
//! sampled history appended, live clients notified.
//!
//! ```text
//! bytes ─▶ parse_payload ─▶ classify (per key)
//!                              │
//!                              ▼
//!                  IdentityCache::resolve ──▶ entity id
//!                              │
//!            update_entity_value (always)
//!                              │
//!            try_append_log (throttled) ──▶ logs
//!                              │
//!            Broadcaster::publish ──▶ /ws/live
//!                              │
//!            AlertMonitor::evaluate ──▶ alerts
//!                              │
//!            ActuatorCommands::switch ──▶ actuator signal (same pipeline)
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertMonitor;
use crate::broadcast::{Broadcaster, LiveEvent};
use crate::command::ActuatorCommands;
use crate::db::Db;
use crate::error::{IngestError, IngestResult};
use crate::identity::{IdentityCache, Resolved};
use crate::state::SharedState;
use crate::store::{NewAlert, NewLog, TelemetryStore};
use crate::telemetry::{classify, parse_payload, Signal, SignalKind};
use crate::throttle::ThrottlePolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalOutcome {
    pub entity_id: i64,
    pub name: String,
    pub kind: SignalKind,
    pub value: Value,
    pub unit: String,
    pub created: bool,
    pub logged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub outcomes: Vec<SignalOutcome>,
    /// Messages of alerts raised by this message.
    pub alerts: Vec<String>,
    /// Actuator keys switched on by threshold automation.
    pub commands: Vec<String>,
}

pub struct IngestService {
    store: Arc<dyn TelemetryStore>,
    cache: IdentityCache,
    policy: ThrottlePolicy,
    notifier: Broadcaster,
    alerts: AlertMonitor,
    commands: Option<Arc<dyn ActuatorCommands>>,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        policy: ThrottlePolicy,
        cache_capacity: usize,
        notifier: Broadcaster,
        alerts: AlertMonitor,
    ) -> Self {
        Self {
            store,
            cache: IdentityCache::new(cache_capacity),
            policy,
            notifier,
            alerts,
            commands: None,
        }
    }

    /// Publish threshold actions through `commands`. Without a sink the
    /// actuator state is still recorded.
    pub fn with_commands(mut self, commands: Arc<dyn ActuatorCommands>) -> Self {
        self.commands = Some(commands);
        self
    }

    #[cfg(test)]
    pub fn notifier(&self) -> &Broadcaster {
        &self.notifier
    }

    /// Parse and ingest one raw device message, stamped with the current time.
    pub async fn ingest_bytes(&self, raw: &[u8]) -> IngestResult<IngestReport> {
        let payload = parse_payload(raw)?;
        self.ingest_map(payload, Db::now_ms()).await
    }

    /// Ingest an already-parsed payload at `now` (unix ms). Fields are
    /// processed in order; a store failure aborts the rest of the message.
    pub async fn ingest_map(&self, payload: Map<String, Value>, now: i64) -> IngestResult<IngestReport> {
        let mut report = IngestReport::default();
        for (key, raw) in &payload {
            let signal = classify(key, raw);
            let mut actions = Vec::new();
            let outcome = self
                .ingest_signal(&signal, now, &mut report.alerts, &mut actions)
                .await?;
            report.outcomes.push(outcome);

            for actuator in actions {
                if report.commands.contains(&actuator) {
                    continue;
                }
                let outcome = self.actuate(&actuator, now, &mut report.alerts).await?;
                report.outcomes.push(outcome);
                report.commands.push(actuator);
            }
        }
        Ok(report)
    }

    /// Switch `actuator` on: send the command, then record the new state
    /// like any reported actuator status.
    async fn actuate(
        &self,
        actuator: &str,
        now: i64,
        alerts: &mut Vec<String>,
    ) -> IngestResult<SignalOutcome> {
        if let Some(commands) = &self.commands {
            match commands.switch(actuator, true) {
                Ok(()) => info!(actuator, "automatic action: switched on"),
                Err(e) => warn!(actuator, error = %format!("{e:#}"), "actuator command not sent"),
            }
        }
        let signal = classify(actuator, &Value::Bool(true));
        // Actuator signals never cross thresholds, so no further actions.
        self.ingest_signal(&signal, now, alerts, &mut Vec::new()).await
    }

    async fn ingest_signal(
        &self,
        signal: &Signal,
        now: i64,
        alerts: &mut Vec<String>,
        actions: &mut Vec<String>,
    ) -> IngestResult<SignalOutcome> {
        let resolved = self.upsert(signal, now).await?;
        let logged = self.append_log(&resolved, signal, now).await?;

        self.notifier
            .publish(LiveEvent::from_signal(resolved.id, signal, now));

        self.check_thresholds(resolved.id, signal, now, alerts, actions).await?;

        Ok(SignalOutcome {
            entity_id: resolved.id,
            name: signal.name.clone(),
            kind: signal.kind,
            value: signal.value.clone(),
            unit: signal.unit.clone(),
            created: resolved.created,
            logged,
        })
    }

    /// Resolve the entity and make its current value this reading.
    async fn upsert(&self, signal: &Signal, now: i64) -> IngestResult<Resolved> {
        let resolved = self.cache.resolve(self.store.as_ref(), signal, now).await?;
        if resolved.created {
            return Ok(resolved);
        }

        let updated = self
            .store
            .update_entity_value(resolved.id, &signal.value, &signal.unit, now)
            .await
            .map_err(IngestError::StoreUnavailable)?;
        if updated {
            return Ok(resolved);
        }

        // Cached id points at a deleted entity; start over from the store.
        warn!(name = %signal.name, entity_id = resolved.id, "cached entity vanished, re-resolving");
        self.cache.forget(&signal.name).await;
        let fresh = self.cache.resolve(self.store.as_ref(), signal, now).await?;
        if !fresh.created {
            self.store
                .update_entity_value(fresh.id, &signal.value, &signal.unit, now)
                .await
                .map_err(IngestError::StoreUnavailable)?;
        }
        Ok(fresh)
    }

    async fn append_log(&self, resolved: &Resolved, signal: &Signal, now: i64) -> IngestResult<bool> {
        if self.policy.rejects_cached(resolved.last_log_ts, now) {
            debug!(key = %signal.key, name = %signal.name, "log throttled");
            return Ok(false);
        }

        let admitted = self
            .store
            .try_append_log(
                &NewLog {
                    entity_id: resolved.id,
                    name: &signal.name,
                    value: &signal.value,
                    kind: signal.kind,
                    unit: &signal.unit,
                    ts: now,
                },
                self.policy.window_start(now),
                self.policy.max_logs,
            )
            .await
            .map_err(IngestError::StoreUnavailable)?;

        if admitted {
            self.cache.mark_logged(&signal.name, now).await;
            info!(name = %signal.name, value = %signal.value, unit = %signal.unit, "log written");
        } else {
            debug!(name = %signal.name, "log throttled by store");
        }
        Ok(admitted)
    }

    async fn check_thresholds(
        &self,
        entity_id: i64,
        signal: &Signal,
        now: i64,
        out: &mut Vec<String>,
        actions: &mut Vec<String>,
    ) -> IngestResult<()> {
        if self.alerts.is_empty() || signal.kind != SignalKind::Sensor {
            return Ok(());
        }
        let (Some(device), Some(value)) = (signal.device, signal.numeric()) else {
            return Ok(());
        };

        let crossings = self.alerts.evaluate(device, value).await;
        for (i, crossing) in crossings.iter().enumerate() {
            let message = crossing.message(&signal.name, &signal.unit);
            let inserted = self
                .store
                .insert_alert(&NewAlert {
                    entity_id,
                    name: &signal.name,
                    value,
                    threshold: crossing.threshold,
                    direction: crossing.direction,
                    message: &message,
                    ts: now,
                })
                .await;
            let alert_id = match inserted {
                Ok(id) => id,
                Err(e) => {
                    // Unrecorded crossings must fire again on the next reading.
                    for c in &crossings[i..] {
                        self.alerts.rearm(device, c.direction).await;
                    }
                    return Err(IngestError::StoreUnavailable(e));
                }
            };

            warn!(alert_id, name = %signal.name, value, threshold = crossing.threshold, "threshold crossed");
            self.notifier
                .publish(LiveEvent::alert(alert_id, signal, message.clone(), now));
            out.push(message);
            if let Some(actuator) = &crossing.actuator {
                actions.push(actuator.clone());
            }
        }
        Ok(())
    }
}

/// Message-handling boundary shared by every transport: errors are logged
/// and recorded, never propagated to the connection.
pub async fn process_message(service: &IngestService, shared: &SharedState, source: &str, raw: &[u8]) {
    match service.ingest_bytes(raw).await {
        Ok(report) => {
            debug!(source, signals = report.outcomes.len(), "message ingested");
            shared.write().await.record_report(source, &report);
        }
        Err(e @ IngestError::InvalidPayload(_)) => {
            warn!(source, error = %e, payload = %String::from_utf8_lossy(raw), "message dropped");
            shared.write().await.record_rejected(format!("{source}: {e}"));
        }
        Err(e @ IngestError::StoreUnavailable(_)) => {
            error!(source, error = %e, "message dropped");
            shared.write().await.record_failure(format!("{source}: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
