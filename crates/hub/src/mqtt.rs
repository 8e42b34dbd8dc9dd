use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::command::ActuatorCommands;
use crate::ingest::{process_message, IngestService};
use crate::state::SharedState;

pub const TELEMETRY_TOPIC: &str = "greenhouse/+/telemetry";
pub const ACTUATOR_TOPIC: &str = "actuators/+";
pub const SENSOR_TOPIC: &str = "capteurs/+";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Status report published by an actuator controller on `actuators/<name>`.
/// The hub publishes its own commands in the same shape.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ActuatorMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    pub(crate) status: Value,
}

impl ActuatorMsg {
    pub(crate) fn command(name: &str, on: bool) -> Self {
        Self {
            name: Some(name.to_string()),
            status: Value::from(if on { "on" } else { "off" }),
        }
    }

    /// One-key flat payload `{name: status}`. The name in the body wins over
    /// the topic segment when both are present.
    pub(crate) fn into_payload(self, topic_name: &str) -> Vec<u8> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| topic_name.to_string());
        let mut map = Map::new();
        map.insert(name, self.status);
        Value::Object(map).to_string().into_bytes()
    }
}

/// Single reading published by a standalone sensor on `capteurs/<type>`.
#[derive(Debug, Deserialize)]
pub(crate) struct SensorMsg {
    #[serde(default, rename = "type")]
    pub(crate) kind: Option<String>,
    pub(crate) value: Value,
}

impl SensorMsg {
    /// One-key flat payload `{type: value}`; the topic segment stands in for
    /// a missing type. Units come from the catalog, so `unit` is ignored.
    pub(crate) fn into_payload(self, topic_type: &str) -> Vec<u8> {
        let key = self
            .kind
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| topic_type.to_string());
        let mut map = Map::new();
        map.insert(key, self.value);
        Value::Object(map).to_string().into_bytes()
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract device_id from "greenhouse/<device_id>/telemetry".
pub(crate) fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "greenhouse" && parts[2] == "telemetry" && !parts[1].is_empty()
    {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract the actuator name from "actuators/<name>".
pub(crate) fn extract_actuator_name(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 2 && parts[0] == "actuators" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract the sensor type from "capteurs/<type>".
pub(crate) fn extract_sensor_type(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 2 && parts[0] == "capteurs" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn actuator_topic(name: &str) -> String {
    format!("actuators/{name}")
}

/// Map an incoming publish to `(source, flat payload)`. Unknown topics yield
/// `None`; a malformed actuator or sensor body is passed through untouched
/// so the pipeline rejects and records it.
pub(crate) fn route(topic: &str, payload: &[u8]) -> Option<(String, Vec<u8>)> {
    if let Some(device_id) = extract_device_id(topic) {
        return Some((format!("mqtt:{device_id}"), payload.to_vec()));
    }
    if let Some(kind) = extract_sensor_type(topic) {
        let body = match serde_json::from_slice::<SensorMsg>(payload) {
            Ok(msg) => msg.into_payload(kind),
            Err(e) => {
                warn!(topic, error = %e, "bad sensor json");
                payload.to_vec()
            }
        };
        return Some((format!("mqtt:capteurs/{kind}"), body));
    }
    let name = extract_actuator_name(topic)?;
    let body = match serde_json::from_slice::<ActuatorMsg>(payload) {
        Ok(msg) => msg.into_payload(name),
        Err(e) => {
            warn!(topic, error = %e, "bad actuator json");
            payload.to_vec()
        }
    };
    Some((format!("mqtt:actuators/{name}"), body))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

impl ActuatorCommands for AsyncClient {
    /// Queued without waiting: the event loop that drains the queue is the
    /// same task that runs the pipeline.
    fn switch(&self, name: &str, on: bool) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&ActuatorMsg::command(name, on))?;
        self.try_publish(actuator_topic(name), QoS::AtLeastOnce, false, body)
            .with_context(|| format!("failed to queue command for {name}"))
    }
}

// ---------------------------------------------------------------------------
// Subscriber loop
// ---------------------------------------------------------------------------

pub fn connect(broker: String, port: u16) -> (AsyncClient, EventLoop) {
    let mut mqttoptions = MqttOptions::new("agri-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(mqttoptions, 20)
}

/// Subscribe and feed every message into the pipeline. Never returns; a
/// broker error is logged and polling resumes after a short back-off.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    ingest: Arc<IngestService>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => match route(&p.topic, &p.payload) {
                Some((source, body)) => {
                    process_message(&ingest, &shared, &source, &body).await;
                }
                None => debug!(topic = %p.topic, "unhandled topic"),
            },
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean sessions drop subscriptions, so renew them on every connect.
                for topic in [TELEMETRY_TOPIC, SENSOR_TOPIC, ACTUATOR_TOPIC] {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        warn!(topic, error = %e, "mqtt subscribe failed");
                    }
                }
                info!("hub subscribed to {TELEMETRY_TOPIC}, {SENSOR_TOPIC} and {ACTUATOR_TOPIC}");

                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                let mut st = shared.write().await;
                if st.mqtt_connected {
                    st.mqtt_connected = false;
                    st.record_system(format!("mqtt error: {e}"));
                }
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
