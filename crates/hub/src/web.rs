use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::db::{Db, LogQuery};
use crate::ingest::{process_message, IngestService};
use crate::state::SharedState;
use crate::store::{Alert, Entity, LogEntry};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 500;

static NEXT_PEER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct AppState {
    pub status: SharedState,
    pub db: Db,
    pub ingest: Arc<IngestService>,
    pub live: Broadcaster,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/entities", get(api_entities))
        .route("/api/entities/{id}", get(api_entity))
        .route("/api/entities/{id}/logs", get(api_entity_logs))
        .route("/api/logs", get(api_logs))
        .route("/api/alerts", get(api_alerts))
        .route("/ws/ingest", get(ws_ingest))
        .route("/ws/live", get(ws_live))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what),
            ApiError::Internal(e) => {
                error!(error = %format!("{e:#}"), "api request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Page {
    pub limit: Option<i64>,
    /// Only entries with a smaller id; pass the previous page's `next_before`.
    pub before: Option<i64>,
}

impl Page {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    /// Cursor for the next (older) page; absent on the last page.
    pub next_before: Option<i64>,
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.status.read().await;
    Json(st.to_status())
}

async fn api_entities(State(state): State<AppState>) -> ApiResult<Vec<Entity>> {
    Ok(Json(state.db.list_entities().await?))
}

async fn api_entity(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Entity> {
    state
        .db
        .get_entity(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("entity {id} not found")))
}

async fn api_entity_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(page): Query<Page>,
) -> ApiResult<LogPage> {
    if state.db.get_entity(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("entity {id} not found")));
    }
    log_page(&state.db, Some(id), &page).await
}

async fn api_logs(State(state): State<AppState>, Query(page): Query<Page>) -> ApiResult<LogPage> {
    log_page(&state.db, None, &page).await
}

async fn log_page(db: &Db, entity_id: Option<i64>, page: &Page) -> ApiResult<LogPage> {
    let limit = page.limit();
    let logs = db
        .list_logs(LogQuery {
            entity_id,
            before: page.before,
            limit,
        })
        .await?;
    let next_before = if logs.len() as i64 == limit {
        logs.last().map(|l| l.id)
    } else {
        None
    };
    Ok(Json(LogPage { logs, next_before }))
}

async fn api_alerts(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<Alert>> {
    Ok(Json(state.db.list_alerts(page.limit()).await?))
}

// ---------------------------------------------------------------------------
// WebSockets
// ---------------------------------------------------------------------------

async fn ws_ingest(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ingest_loop(state, socket))
}

async fn ws_live(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| live_loop(state, socket))
}

/// One device connection: every text frame is one payload. Errors are
/// recorded by the pipeline and never close the socket.
async fn ingest_loop(state: AppState, mut socket: WebSocket) {
    let peer = format!("ws#{}", NEXT_PEER.fetch_add(1, Ordering::Relaxed));
    info!(%peer, "device connected");
    state.status.write().await.device_connected(&peer);

    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(text)) => {
                process_message(&state.ingest, &state.status, &peer, text.as_str().as_bytes()).await;
            }
            Ok(Message::Binary(_)) => warn!(%peer, "binary frame ignored"),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%peer, error = %e, "websocket read failed");
                break;
            }
        }
    }

    info!(%peer, "device disconnected");
    state.status.write().await.device_disconnected(&peer);
}

/// Dashboard connection: forwards every live event until the client leaves.
async fn live_loop(state: AppState, mut socket: WebSocket) {
    let mut rx = state.live.subscribe();
    debug!(subscribers = state.live.subscriber_count(), "live client connected");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(ev) => {
                    let text = match serde_json::to_string(&ev) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(error = %e, "live event not serializable");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("live client disconnected");
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
