mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{GreenhouseSim, Scenario};

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn telemetry_topic(device_id: &str) -> String {
    format!("greenhouse/{device_id}/telemetry")
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "gh-1".to_string());
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 30);
    let day_length_s: f64 = env_or("SIM_DAY_S", 86_400.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let client_id = format!("agri-node-{device_id}");

    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // We only publish, but the eventloop still has to run to keep the
    // connection alive.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("node connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = telemetry_topic(&device_id);
    info!(%topic, %scenario, sample_every_s, "publishing simulated telemetry");

    let mut sim = GreenhouseSim::new(scenario, day_length_s);

    loop {
        let snapshot = sim.tick(now_unix() as f64);
        let payload = serde_json::to_vec(&snapshot)?;

        match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => debug!(?snapshot, "published telemetry"),
            Err(e) => warn!(error = %e, "publish error"),
        }

        sleep(Duration::from_secs(sample_every_s.max(1))).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
