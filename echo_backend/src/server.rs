use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::EchoConfig;
use crate::proactive::arbitrator::{CycleOutcome, SubmitOutcome};
use crate::proactive::candidate::{Candidate, CandidateCategory};
use crate::proactive::{EngineEvent, EngineStatus};
use crate::runtime::BackendRuntime;
use crate::signals::{SignalKind, SignalRecord};

#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<BackendRuntime>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ForceRequest {
    category: String,
}

#[derive(Debug, Serialize)]
struct ForceResponse {
    accepted: bool,
    candidate_id: String,
    emitted: Option<Candidate>,
    cooldown_remaining_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct DismissResponse {
    dismissed: bool,
}

#[derive(Debug, Deserialize)]
struct InteractionRequest {
    summary: String,
}

#[derive(Debug, Serialize)]
struct RecordedResponse {
    status: &'static str,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    score: f32,
    label: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<EngineEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("ECHO_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid ECHO_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let runtime = Arc::new(runtime);
    let state = Arc::new(ServerState {
        runtime: runtime.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    runtime.start_proactive().await;

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Echo backend listening on http://{}", bind_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Backend server failed");

    runtime.shutdown().await;
    served
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config).put(update_config))
        .route("/proactive/pending", get(list_pending))
        .route("/proactive/status", get(get_status))
        .route("/proactive/force", post(force_candidate))
        .route("/proactive/:id/dismiss", post(dismiss_candidate))
        .route("/proactive/:id/respond", post(respond_to_candidate))
        .route("/interactions", post(record_interaction))
        .route("/signals/:source", post(ingest_signal))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<EngineEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_engine_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_engine_event(event: EngineEvent) -> ApiEventEnvelope {
    match event {
        EngineEvent::ProactiveMessage(candidate) => envelope(
            "proactive_message",
            serde_json::to_value(candidate).unwrap_or_else(|_| serde_json::json!({})),
        ),
        EngineEvent::CandidateDismissed { id } => {
            envelope("candidate_dismissed", serde_json::json!({ "id": id }))
        }
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("ECHO_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("ECHO_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "ECHO_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid ECHO_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

const MASKED_API_KEY: &str = "********";

fn masked_config(mut config: EchoConfig) -> EchoConfig {
    if config.llm_api_key.is_some() {
        config.llm_api_key = Some(MASKED_API_KEY.to_string());
    }
    config
}

/// A client echoing back the masked key means "keep the current one".
fn unmask_api_key(mut incoming: EchoConfig, current: &EchoConfig) -> EchoConfig {
    if incoming.llm_api_key.as_deref() == Some(MASKED_API_KEY) {
        incoming.llm_api_key = current.llm_api_key.clone();
    }
    incoming
}

async fn get_config(State(state): State<Arc<ServerState>>) -> Json<EchoConfig> {
    Json(masked_config(state.runtime.config.clone()))
}

/// Writes the config file; the running engine keeps its settings until restart.
async fn update_config(
    State(state): State<Arc<ServerState>>,
    Json(new_config): Json<EchoConfig>,
) -> Result<Json<EchoConfig>, (StatusCode, String)> {
    let new_config = unmask_api_key(new_config, &state.runtime.config);
    new_config
        .save()
        .map_err(|error| internal_error(error.context("Failed to save config")))?;
    tracing::info!("Config updated; changes apply on next start");
    Ok(Json(masked_config(new_config)))
}

async fn list_pending(State(state): State<Arc<ServerState>>) -> Json<Vec<Candidate>> {
    Json(state.runtime.engine.pending_candidates().await)
}

async fn get_status(State(state): State<Arc<ServerState>>) -> Json<EngineStatus> {
    Json(state.runtime.engine.status().await)
}

async fn force_candidate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ForceRequest>,
) -> Result<Json<ForceResponse>, (StatusCode, String)> {
    let category = CandidateCategory::from_db(&body.category).ok_or_else(|| {
        bad_request(format!("unknown candidate category '{}'", body.category))
    })?;

    let outcome = state.runtime.engine.force_candidate(category).await;
    let (accepted, candidate_id) = match outcome.submit {
        SubmitOutcome::Accepted { id } => (true, id),
        SubmitOutcome::Duplicate { existing_id } => (false, existing_id),
    };
    let cooldown_remaining_secs = match &outcome.cycle {
        CycleOutcome::CoolingDown { remaining_secs } => Some(*remaining_secs),
        _ => None,
    };
    Ok(Json(ForceResponse {
        accepted,
        candidate_id,
        emitted: outcome.cycle.emitted().cloned(),
        cooldown_remaining_secs,
    }))
}

async fn dismiss_candidate(
    State(state): State<Arc<ServerState>>,
    Path(candidate_id): Path<String>,
) -> Json<DismissResponse> {
    let dismissed = state.runtime.engine.dismiss(&candidate_id).await;
    Json(DismissResponse { dismissed })
}

async fn respond_to_candidate(
    State(state): State<Arc<ServerState>>,
    Path(candidate_id): Path<String>,
    Json(body): Json<RespondRequest>,
) -> Result<Json<DismissResponse>, (StatusCode, String)> {
    let text = body.text.trim();
    if text.is_empty() {
        return Err(bad_request("text cannot be empty".to_string()));
    }
    let dismissed = state
        .runtime
        .respond(&candidate_id, text)
        .await
        .map_err(internal_error)?;
    Ok(Json(DismissResponse { dismissed }))
}

async fn record_interaction(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<InteractionRequest>,
) -> Result<Json<RecordedResponse>, (StatusCode, String)> {
    state
        .runtime
        .record_interaction(&body.summary)
        .map_err(internal_error)?;
    Ok(Json(RecordedResponse {
        status: "recorded",
        id: None,
    }))
}

async fn ingest_signal(
    State(state): State<Arc<ServerState>>,
    Path(source): Path<String>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<RecordedResponse>, (StatusCode, String)> {
    let kind = SignalKind::from_db(&source)
        .ok_or_else(|| not_found(format!("unknown signal source '{}'", source)))?;
    if body.title.trim().is_empty() && body.content.trim().is_empty() {
        return Err(bad_request("title or content is required".to_string()));
    }

    let mut record = SignalRecord::new(
        body.created_at.unwrap_or_else(Utc::now),
        body.title,
        body.content,
    )
    .with_score(body.score);
    if let Some(id) = body.id.filter(|id| !id.trim().is_empty()) {
        record = record.with_id(id);
    }
    if let Some(label) = body.label {
        record = record.with_label(label);
    }

    let id = record.id.clone();
    state
        .runtime
        .ingest_signal(kind, record)
        .map_err(internal_error)?;
    Ok(Json(RecordedResponse {
        status: "recorded",
        id: Some(id),
    }))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Websocket subscriber lagged by {} event(s)", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn bad_request(message: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
