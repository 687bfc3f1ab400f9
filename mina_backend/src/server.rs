use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};

use crate::agent::{
    AgentEvent, ConsolidationPhase, ConversationEngine, MemoryConsolidator, SharedMind,
};
use crate::conversation::Turn;
use crate::emotion::EmotionState;
use crate::memory::MemoryRecord;
use crate::runtime::BackendRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<Mutex<ConversationEngine>>,
    pub mind: SharedMind,
    pub consolidator: MemoryConsolidator,
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
struct ChatRequest {
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    reply: String,
}

#[derive(Debug, Serialize)]
struct ConsolidationStatusResponse {
    in_flight: bool,
    dispatched_jobs: u64,
    job_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<AgentEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("MINA_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid MINA_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);
    let drain_timeout =
        std::time::Duration::from_secs(runtime.config.gateway_timeout_secs.max(1));

    let state = Arc::new(ServerState {
        engine: runtime.engine.clone(),
        mind: runtime.mind.clone(),
        consolidator: runtime.consolidator.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    spawn_preamble_sync(runtime.engine.clone(), runtime.mind.subscribe());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Mina backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Backend server failed")?;

    if runtime.consolidator.is_in_flight() {
        tracing::info!("Waiting for in-flight consolidation before exit");
        if tokio::time::timeout(drain_timeout, runtime.consolidator.wait_until_idle())
            .await
            .is_err()
        {
            tracing::warn!("Consolidation still running after {:?}; exiting", drain_timeout);
        }
    }
    runtime.engine.lock().await.observe_completions().await;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/memories", get(list_memories))
        .route("/emotion", get(get_emotion))
        .route("/conversation", get(get_conversation))
        .route("/consolidation", get(get_consolidation))
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
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<AgentEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_agent_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

/// Install each finished consolidation into the window without waiting for
/// the next chat turn.
fn spawn_preamble_sync(
    engine: Arc<Mutex<ConversationEngine>>,
    mut mind_updates: watch::Receiver<u64>,
) {
    tokio::spawn(async move {
        while mind_updates.changed().await.is_ok() {
            engine.lock().await.observe_completions().await;
        }
    });
}

fn map_agent_event(event: AgentEvent) -> ApiEventEnvelope {
    match event {
        AgentEvent::TurnCompleted {
            reply,
            used_fallback,
        } => envelope(
            "turn_completed",
            serde_json::json!({ "reply": reply, "used_fallback": used_fallback }),
        ),
        AgentEvent::ConsolidationStarted { job_id, lines } => envelope(
            "consolidation_started",
            serde_json::json!({ "job_id": job_id, "lines": lines }),
        ),
        AgentEvent::ConsolidationSkipped { reason } => envelope(
            "consolidation_skipped",
            serde_json::json!({ "reason": reason }),
        ),
        AgentEvent::MemoryConsolidated {
            job_id,
            summary,
            importance,
            emotion,
        } => envelope(
            "memory_consolidated",
            serde_json::json!({
                "job_id": job_id,
                "summary": summary,
                "importance": importance,
                "emotion": serde_json::to_value(emotion).unwrap_or_else(|_| serde_json::json!({}))
            }),
        ),
        AgentEvent::ConsolidationFailed { job_id, error } => envelope(
            "consolidation_failed",
            serde_json::json!({ "job_id": job_id, "error": error }),
        ),
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
    let mode = parse_auth_mode(std::env::var("MINA_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("MINA_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "MINA_BACKEND_TOKEN is required when auth mode is 'required'"
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
            "Invalid MINA_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
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

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    if request.content.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "content must not be empty".to_string()));
    }
    // One turn at a time
    let mut engine = state.engine.lock().await;
    let reply = engine.handle_user_turn(&request.content).await;
    Ok(Json(ChatResponse { reply }))
}

async fn list_memories(State(state): State<Arc<ServerState>>) -> Json<Vec<MemoryRecord>> {
    Json(state.mind.memories().await.records().to_vec())
}

async fn get_emotion(State(state): State<Arc<ServerState>>) -> Json<EmotionState> {
    Json(state.mind.emotion().await)
}

async fn get_conversation(State(state): State<Arc<ServerState>>) -> Json<Vec<Turn>> {
    let mut engine = state.engine.lock().await;
    engine.observe_completions().await;
    Json(engine.window().turns().to_vec())
}

async fn get_consolidation(
    State(state): State<Arc<ServerState>>,
) -> Json<ConsolidationStatusResponse> {
    let (job_id, started_at) = match state.consolidator.phase() {
        ConsolidationPhase::Idle => (None, None),
        ConsolidationPhase::Dispatched { job_id, started_at } => (Some(job_id), Some(started_at)),
    };
    Json(ConsolidationStatusResponse {
        in_flight: job_id.is_some(),
        dispatched_jobs: state.consolidator.dispatched_jobs(),
        job_id,
        started_at,
    })
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
                        tracing::debug!("Websocket client lagged; dropped {} events", skipped);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::ScriptedGateway;
    use crate::config::AgentConfig;
    use crate::persistence::InMemoryStateStore;
    use crate::runtime::BackendRuntimeBuilder;
    use axum::http::HeaderValue;

    fn state_with(config: AgentConfig, auth: BackendAuthConfig) -> Arc<ServerState> {
        let runtime = BackendRuntimeBuilder::new(config)
            .with_gateway(Arc::new(ScriptedGateway::new()))
            .with_store(Arc::new(InMemoryStateStore::default()))
            .build()
            .unwrap();
        let (ws_events, _) = broadcast::channel(16);
        Arc::new(ServerState {
            engine: runtime.engine,
            mind: runtime.mind,
            consolidator: runtime.consolidator,
            auth,
            ws_events,
        })
    }

    fn test_state() -> Arc<ServerState> {
        state_with(
            AgentConfig::default(),
            BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            },
        )
    }

    fn required(token: &str) -> BackendAuthConfig {
        BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some(token.to_string()),
        }
    }

    fn bearer(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn authorize_trims_header_but_matches_scheme_exactly() {
        let auth = required("mina-local");
        assert!(authorize(&bearer("  Bearer mina-local  "), &auth).is_ok());
        assert!(authorize(&bearer("bearer mina-local"), &auth).is_err());
        assert!(authorize(&bearer("Bearer mina-local-2"), &auth).is_err());
        assert!(authorize(&bearer("mina-local"), &auth).is_err());
        assert!(authorize(&HeaderMap::new(), &auth).is_err());
    }

    #[test]
    fn required_mode_without_token_rejects_everything() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Required,
            token: None,
        };
        assert_eq!(
            authorize(&bearer("Bearer anything"), &auth),
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn auth_mode_aliases_are_case_and_space_insensitive() {
        assert_eq!(parse_auth_mode(None).unwrap(), AuthMode::Required);
        assert_eq!(parse_auth_mode(Some("  ".to_string())).unwrap(), AuthMode::Required);
        assert_eq!(parse_auth_mode(Some(" OFF ".to_string())).unwrap(), AuthMode::Disabled);
        assert_eq!(parse_auth_mode(Some("Enabled".to_string())).unwrap(), AuthMode::Required);
        assert!(parse_auth_mode(Some("sometimes".to_string())).is_err());
    }

    #[tokio::test]
    async fn router_guards_chat_behind_bearer_token() {
        let state = state_with(AgentConfig::default(), required("mina-local"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = reqwest::Client::new();
        let url = format!("http://{}/v1/chat", addr);

        let response = client
            .post(&url)
            .json(&serde_json::json!({ "content": "let me in" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(state.engine.lock().await.window().len(), 1);

        let response = client
            .post(&url)
            .bearer_auth("mina-local")
            .json(&serde_json::json!({ "content": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = client
            .post(&url)
            .bearer_auth("mina-local")
            .json(&serde_json::json!({ "content": "let me in" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["reply"], "reply 1");
    }

    #[tokio::test]
    async fn conversation_shows_preamble_from_finished_consolidation() {
        let config = AgentConfig {
            consolidation_period: 1,
            ..AgentConfig::default()
        };
        let state = state_with(
            config,
            BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            },
        );
        chat(
            State(state.clone()),
            Json(ChatRequest {
                content: "I just adopted a greyhound".to_string(),
            }),
        )
        .await
        .unwrap();
        state.consolidator.wait_until_idle().await;

        let Json(turns) = get_conversation(State(state.clone())).await;
        assert!(turns[0].content.contains("Chatted about the day"));
    }

    #[test]
    fn map_agent_event_includes_event_type_and_timestamp() {
        let envelope = map_agent_event(AgentEvent::ConsolidationFailed {
            job_id: "job-1".to_string(),
            error: "gateway call timed out after 60s".to_string(),
        });
        assert_eq!(envelope.event_type, "consolidation_failed");
        assert_eq!(envelope.payload["job_id"], "job-1");
        assert!(envelope.emitted_at <= Utc::now());

        let envelope = map_agent_event(AgentEvent::MemoryConsolidated {
            job_id: "job-2".to_string(),
            summary: "User moved to Lisbon".to_string(),
            importance: 8,
            emotion: EmotionState::default(),
        });
        assert_eq!(envelope.payload["importance"], 8);
        assert_eq!(envelope.payload["emotion"]["stress"], 3);
    }

    #[tokio::test]
    async fn chat_rejects_blank_content() {
        let state = test_state();
        let err = chat(
            State(state.clone()),
            Json(ChatRequest {
                content: "  ".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(state.engine.lock().await.window().len(), 1);
    }

    #[tokio::test]
    async fn chat_runs_a_turn_and_exposes_state() {
        let state = test_state();
        let Json(response) = chat(
            State(state.clone()),
            Json(ChatRequest {
                content: "hello there".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.reply, "reply 1");

        let Json(turns) = get_conversation(State(state.clone())).await;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1], Turn::user("hello there"));

        let Json(status) = get_consolidation(State(state.clone())).await;
        assert!(!status.in_flight);
        assert_eq!(status.dispatched_jobs, 0);

        let Json(emotion) = get_emotion(State(state.clone())).await;
        assert_eq!(emotion, EmotionState::default());
        let Json(memories) = list_memories(State(state)).await;
        assert!(memories.is_empty());
    }
}
