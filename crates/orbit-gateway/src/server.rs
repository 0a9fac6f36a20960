use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use orbit_common::Role;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::auth::{self, AppState};
use crate::hub::RelayHub;
use crate::ws;

#[derive(Deserialize)]
struct ClientQuery {
    token: Option<String>,
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

#[derive(Deserialize)]
struct AnchorQuery {
    token: Option<String>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (clients, anchors) = state
        .hub
        .with_inner(|inner| (inner.routing.user_clients.values().map(|s| s.len()).sum::<usize>(), inner.routing.user_anchors.values().map(|s| s.len()).sum::<usize>()))
        .await;
    Json(json!({
        "status": "ok",
        "authMode": state.config.auth.mode,
        "clients": clients,
        "anchors": anchors,
    }))
}

fn bearer_or_query(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .or_else(|| query_token.map(str::to_owned))
}

async fn client_upgrade(
    ws: Option<WebSocketUpgrade>,
    Query(q): Query<ClientQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(token) = q.token.clone() else {
        return (StatusCode::UNAUTHORIZED, "Unauthorised").into_response();
    };
    let Some(user_id) = auth::authenticate_web(&state, &token).await else {
        return (StatusCode::UNAUTHORIZED, "Unauthorised").into_response();
    };
    // A non-upgrade preflight GET (no `Upgrade: websocket` header) is
    // authenticated but has nothing to upgrade (spec.md §6).
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "Upgrade required").into_response();
    };
    ws.on_upgrade(move |socket| ws::run(socket, state.hub, Role::Client, user_id, q.client_id))
        .into_response()
}

async fn anchor_upgrade(
    ws: Option<WebSocketUpgrade>,
    Query(q): Query<AnchorQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(token) = q.token.clone() else {
        return (StatusCode::UNAUTHORIZED, "Unauthorised").into_response();
    };
    let Some(user_id) = auth::authenticate_anchor(&state, &token).await else {
        return (StatusCode::UNAUTHORIZED, "Unauthorised").into_response();
    };
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "Upgrade required").into_response();
    };
    ws.on_upgrade(move |socket| ws::run(socket, state.hub, Role::Anchor, user_id, None)).into_response()
}

#[derive(Deserialize)]
struct ArtifactsQuery {
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    limit: Option<usize>,
    #[serde(rename = "beforeId")]
    before_id: Option<i64>,
}

/// REST parity for `orbit.artifacts.list`, for callers that are not
/// maintaining a live socket.
async fn artifacts(
    headers: HeaderMap,
    Query(q): Query<ArtifactsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(token) = bearer_or_query(&headers, None) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "authentication required" }))).into_response();
    };
    let Some(user_id) = auth::authenticate_web(&state, &token).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "authentication required" }))).into_response();
    };

    let limit = q.limit.unwrap_or(50);
    match state.hub.storage().list_artifacts(&user_id, q.thread_id.as_deref(), limit, q.before_id).await {
        Ok(artifacts) => {
            let next_before_id = artifacts.iter().map(|a| a.id).min();
            Json(json!({ "artifacts": artifacts, "nextBeforeId": next_before_id })).into_response()
        }
        Err(error) => {
            tracing::debug!(%error, "failed to list artifacts over REST");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Build the gateway router (split out so tests can mount it on an
/// ephemeral port without going through `start_gateway`).
pub fn build_gateway_app(state: AppState) -> Router {
    let cors = match state.config.cors_origins.first().map(String::as_str) {
        Some("*") | None => CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        _ => {
            let origins: Vec<_> = state
                .config
                .cors_origins
                .iter()
                .filter_map(|o| axum::http::HeaderValue::from_str(o).ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any)
        }
    };

    Router::new()
        .route("/health", get(health))
        .route("/ws/client", get(client_upgrade))
        .route("/ws/anchor", get(anchor_upgrade))
        .route("/relay/artifacts", get(artifacts))
        .route("/auth/session", get(auth::session))
        .route("/auth/register/basic", post(auth::register_basic))
        .route("/auth/login/basic", post(auth::login_basic))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/device/code", post(auth::device_code_start))
        .route("/auth/device/authorise", post(auth::device_authorise))
        .route("/auth/device/token", post(auth::device_poll))
        .route("/auth/device/refresh", post(auth::device_refresh))
        .route("/auth/register/options", post(auth::passkey_not_implemented))
        .route("/auth/register/verify", post(auth::passkey_not_implemented))
        .route("/auth/login/options", post(auth::passkey_not_implemented))
        .route("/auth/login/verify", post(auth::passkey_not_implemented))
        .layer(cors)
        .with_state(state)
}

/// Start the gateway HTTP + WebSocket server: load config, open storage,
/// build the router, bind, and serve.
pub async fn start_gateway(bind_override: Option<&str>, port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = orbit_config::discover_and_load();
    if let Some(bind) = bind_override {
        config.bind = bind.to_owned();
    }
    if let Some(port) = port_override {
        config.port = port;
    }
    let config = Arc::new(config);

    let pool = SqlitePool::connect(&format!("sqlite://{}?mode=rwc", config.database_path)).await?;
    orbit_storage::SqliteStorage::init(&pool).await?;
    let storage: Arc<dyn orbit_storage::Storage> = Arc::new(orbit_storage::SqliteStorage::new(pool));

    let hub = RelayHub::new(storage, config.retention, Duration::from_millis(config.dispatch_timeout_ms));
    let state = AppState { hub, config: Arc::clone(&config) };

    let app = build_gateway_app(state);

    let addr = SocketAddr::from_str(&format!("{}:{}", config.bind, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let lines = [
        format!("orbit gateway v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on {addr}"),
        format!("auth mode: {}", config.auth.mode),
        format!("retention: {}, dispatch timeout: {}ms", config.retention, config.dispatch_timeout_ms),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
