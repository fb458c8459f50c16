//! HTTP routes and the WebSocket session handler.
//!
//! Everything here is transport glue: socket plumbing, route wiring, and
//! status-code mapping. Relay semantics live in `courier-core`.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_core::{
    ClientHandle, Inbound, MessageStore, Relay, RelayConfig, StatsLedger, StoreError,
    UserDirectory,
};
use courier_store::SqliteStore;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay engine.
    pub relay: Relay,
    /// Registered user accounts.
    pub directory: Arc<dyn UserDirectory>,
    /// Stored messages, for the query route.
    pub messages: Arc<dyn MessageStore>,
    /// Stats records, for the query route.
    pub stats: Arc<dyn StatsLedger>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state, opening the store named by the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(if config.storage.is_memory() {
            SqliteStore::open_in_memory()?
        } else {
            SqliteStore::open(&config.storage.path)?
        });

        let relay_config = RelayConfig {
            max_content_bytes: config.limits.max_content_bytes,
        };

        Ok(Self {
            relay: Relay::with_config(store.clone(), store.clone(), relay_config),
            directory: store.clone(),
            messages: store.clone(),
            stats: store,
            config,
        })
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws/:username", addr);

    serve(listener, state).await
}

/// Serve on an already-bound listener. Split out so tests can bind port 0.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Build the route table.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/:username", get(ws_handler))
        .route("/users", post(create_user_handler))
        .route("/messages/:username", get(list_messages_handler))
        .route("/user_message_stats/:username", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({"error": message.into()})),
    )
        .into_response()
}

// -- User creation --

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

/// `POST /users`: register a new user account.
pub async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateUserRequest>,
) -> Response {
    if request.username.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "username required");
    }

    match state.directory.create_user(&request.username).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"message": "user created"})),
        )
            .into_response(),
        Err(StoreError::AlreadyExists(_)) => {
            api_error(StatusCode::CONFLICT, "user already exists")
        }
        Err(e) => {
            error!(error = %e, "create user failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// -- Message history --

/// `GET /messages/:username`: every stored message involving the user.
///
/// Unknown users are a 404, distinct from a known user with no messages.
/// Records report `receive_status` exactly as persisted.
pub async fn list_messages_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Response {
    match state.directory.exists(&username).await {
        Ok(true) => {}
        Ok(false) => return api_error(StatusCode::NOT_FOUND, "user does not exist"),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    match state.messages.backlog_for(&username).await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// -- Stats --

/// `GET /user_message_stats/:username`: per-correspondent counters.
pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Response {
    match state.stats.get(&username).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(StoreError::NotFound(_)) => api_error(StatusCode::NOT_FOUND, "no stats for user"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// -- WebSocket sessions --

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Credential verification happens upstream; this gate only refuses
/// upgrades that arrive without credentials when the deployment requires
/// them.
fn authenticate(username: &str, token: Option<&str>, config: &Config) -> Option<String> {
    if username.is_empty() {
        return None;
    }
    if config.auth.require_token && token.is_none() {
        return None;
    }
    Some(username.to_string())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(username): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = match authenticate(&username, params.token.as_deref(), &state.config) {
        Some(identity) => identity,
        None => return api_error(StatusCode::UNAUTHORIZED, "missing credentials"),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
        .into_response()
}

/// Drive one WebSocket connection through the relay state machine.
async fn handle_socket(socket: WebSocket, identity: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(identity, "websocket connected");

    let (mut sink, stream) = socket.split();
    let (handle, mut outbound) = ClientHandle::channel();

    // Writer task: drain the outbound queue into the socket. Keeping this
    // separate from the read loop means a slow peer never blocks dispatch.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "encode outbound frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let inbound = WsInbound { stream };
    match state.relay.handle_connection(&identity, handle, inbound).await {
        Ok(summary) => {
            metrics::record_replayed(summary.replayed);
            metrics::record_relayed("delivered", summary.delivered);
            metrics::record_relayed("queued", summary.queued);
            if summary.failed > 0 {
                metrics::record_error("event");
            }
        }
        Err(e) => {
            warn!(identity, error = %e, "connect rejected");
            metrics::record_error("connect");
        }
    }

    writer.abort();
    debug!(identity, "websocket closed");
}

/// Adapt the read half of a WebSocket into the relay's inbound stream.
struct WsInbound {
    stream: futures_util::stream::SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl Inbound for WsInbound {
    async fn recv(&mut self) -> Option<String> {
        while let Some(next) = self.stream.next().await {
            match next {
                Ok(WsMessage::Text(text)) => return Some(text),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(text),
                    Err(_) => warn!("dropping non-UTF-8 binary payload"),
                },
                // axum answers pings itself
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(_)) => return None,
                Err(e) => {
                    debug!(error = %e, "websocket receive error");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.storage.path = ":memory:".to_string();
        config.metrics.enabled = false;
        Arc::new(AppState::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_create_user_then_conflict() {
        let state = test_state();
        let request = || CreateUserRequest {
            username: "alice".to_string(),
        };

        let response = create_user_handler(State(state.clone()), Json(request())).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = create_user_handler(State(state), Json(request())).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_create_user_rejects_empty_username() {
        let state = test_state();
        let response = create_user_handler(
            State(state),
            Json(CreateUserRequest {
                username: String::new(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_messages_unknown_user_is_404() {
        let state = test_state();
        let response =
            list_messages_handler(State(state), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_messages_known_user_empty_is_200() {
        let state = test_state();
        state.directory.create_user("alice").await.unwrap();

        let response =
            list_messages_handler(State(state), Path("alice".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_not_found_vs_present() {
        let state = test_state();

        let response = stats_handler(State(state.clone()), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state.stats.ensure_entry("alice").await.unwrap();
        let response = stats_handler(State(state), Path("alice".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_authenticate_gate() {
        let mut config = Config::default();
        assert!(authenticate("alice", None, &config).is_some());
        assert!(authenticate("", None, &config).is_none());

        config.auth.require_token = true;
        assert!(authenticate("alice", None, &config).is_none());
        assert_eq!(
            authenticate("alice", Some("t0ken"), &config).as_deref(),
            Some("alice")
        );
    }
}
