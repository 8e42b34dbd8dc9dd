mod alerts;
mod broadcast;
mod command;
mod config;
mod db;
mod error;
mod identity;
mod ingest;
mod mqtt;
mod state;
mod store;
mod telemetry;
mod throttle;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use alerts::AlertMonitor;
use broadcast::Broadcaster;
use db::Db;
use ingest::IngestService;
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:agri-hub.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;
    let policy = cfg.ingest.policy();
    info!(
        interval_secs = policy.interval.as_secs(),
        max_logs = policy.max_logs,
        thresholds = cfg.thresholds.len(),
        "config loaded"
    );

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let entities = db.list_entities().await?;
    info!(entities = entities.len(), "db ready");

    // ── MQTT client (threshold actions publish through it) ──────────
    let (mqtt_client, eventloop) = mqtt::connect(broker, port);

    // ── Ingest pipeline ─────────────────────────────────────────────
    let alerts = AlertMonitor::new(cfg.bounds());
    if alerts.is_empty() {
        warn!("no thresholds configured, alerts disabled");
    }
    let live = Broadcaster::new(cfg.ingest.broadcast_capacity);
    let ingest = Arc::new(
        IngestService::new(
            Arc::new(db.clone()),
            policy,
            cfg.ingest.identity_cache_capacity,
            live.clone(),
            alerts,
        )
        .with_commands(Arc::new(mqtt_client.clone())),
    );

    // ── Shared state (ephemeral, for the dashboard) ─────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        status: Arc::clone(&shared),
        db,
        ingest: Arc::clone(&ingest),
        live,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    mqtt::run(mqtt_client, eventloop, ingest, shared).await;
    Ok(())
}
