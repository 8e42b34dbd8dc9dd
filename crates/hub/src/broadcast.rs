//! Best-effort fan-out of state changes to live dashboard connections.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::telemetry::{Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveEventType {
    Sensor,
    Actuator,
    Unknown,
    Alert,
}

/// Wire shape pushed to `/ws/live`. Actuators carry `status`, everything
/// else carries `value`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    #[serde(rename = "type")]
    pub kind: LiveEventType,
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
    pub unit: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LiveEvent {
    pub fn from_signal(entity_id: i64, signal: &Signal, ts: i64) -> Self {
        let (kind, value, status) = match signal.kind {
            SignalKind::Actuator => (LiveEventType::Actuator, None, signal.status()),
            SignalKind::Sensor => (LiveEventType::Sensor, Some(signal.value.clone()), None),
            SignalKind::Unknown => (LiveEventType::Unknown, Some(signal.value.clone()), None),
        };
        Self {
            kind,
            id: entity_id,
            name: signal.name.clone(),
            value,
            status,
            unit: signal.unit.clone(),
            ts,
            message: None,
        }
    }

    pub fn alert(alert_id: i64, signal: &Signal, message: String, ts: i64) -> Self {
        Self {
            kind: LiveEventType::Alert,
            id: alert_id,
            name: signal.name.clone(),
            value: Some(signal.value.clone()),
            status: None,
            unit: signal.unit.clone(),
            ts,
            message: Some(message),
        }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<LiveEvent>,
}

impl Broadcaster {
    /// `capacity` is how many events a slow subscriber may fall behind
    /// before it starts skipping.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers the event was queued for. Having none is
    /// normal.
    pub fn publish(&self, event: LiveEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::classify;
    use serde_json::json;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn sensor_event_shape() {
        let ev = LiveEvent::from_signal(7, &classify("temperature", &json!(23.5)), 1_000);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "sensor");
        assert_eq!(v["id"], 7);
        assert_eq!(v["name"], "Température");
        assert_eq!(v["value"], 23.5);
        assert_eq!(v["unit"], "°C");
        assert!(v.get("status").is_none());
        assert!(v.get("message").is_none());
    }

    #[test]
    fn actuator_event_carries_status() {
        let ev = LiveEvent::from_signal(3, &classify("pompe", &json!("on")), 1_000);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "actuator");
        assert_eq!(v["status"], true);
        assert!(v.get("value").is_none());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let b = Broadcaster::new(4);
        let ev = LiveEvent::from_signal(1, &classify("gas", &json!(400)), 0);
        assert_eq!(b.publish(ev), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let b = Broadcaster::new(4);
        let mut r1 = b.subscribe();
        let mut r2 = b.subscribe();
        let ev = LiveEvent::from_signal(1, &classify("gas", &json!(400)), 0);

        assert_eq!(b.publish(ev.clone()), 2);
        assert_eq!(r1.recv().await.unwrap(), ev);
        assert_eq!(r2.recv().await.unwrap(), ev);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let b = Broadcaster::new(4);
        let r1 = b.subscribe();
        let mut r2 = b.subscribe();
        drop(r1);

        let ev = LiveEvent::from_signal(1, &classify("soil", &json!(40)), 0);
        assert_eq!(b.publish(ev.clone()), 1);
        assert_eq!(r2.recv().await.unwrap(), ev);
    }

    #[tokio::test]
    async fn slow_subscriber_skips_ahead() {
        let b = Broadcaster::new(2);
        let mut slow = b.subscribe();
        for i in 0..5 {
            b.publish(LiveEvent::from_signal(i, &classify("gas", &json!(i)), i));
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        // Continues from the oldest retained event.
        assert_eq!(slow.recv().await.unwrap().id, 3);
    }
}
