use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use orbit_common::now_sec;
use orbit_config::OrbitConfig;
use rand::Rng;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::hub::RelayHub;

const WEB_ISSUER: &str = "orbit-auth";
const WEB_AUDIENCE: &str = "orbit-web";
const ANCHOR_ISSUER: &str = "orbit-anchor";
const ANCHOR_AUDIENCE: &str = "orbit-anchor";

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub config: Arc<OrbitConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebClaims {
    iss: String,
    aud: String,
    sub: String,
    jti: String,
    iat: u64,
    exp: u64,
}

/// Mint a web session JWT (`sub` = user id, `jti` = session id).
fn mint_web_token(config: &OrbitConfig, user_id: &str, session_id: &str) -> anyhow::Result<String> {
    let iat = now_sec();
    let claims = WebClaims {
        iss: WEB_ISSUER.to_owned(),
        aud: WEB_AUDIENCE.to_owned(),
        sub: user_id.to_owned(),
        jti: session_id.to_owned(),
        iat,
        exp: iat + config.auth.access_ttl_sec,
    };
    let key = EncodingKey::from_secret(config.auth.web_jwt_secret.expose_secret().as_bytes());
    Ok(encode(&Header::default(), &claims, &key)?)
}

fn verify_web_token(config: &OrbitConfig, token: &str) -> Option<WebClaims> {
    let key = DecodingKey::from_secret(config.auth.web_jwt_secret.expose_secret().as_bytes());
    let mut validation = Validation::default();
    validation.set_issuer(&[WEB_ISSUER]);
    validation.set_audience(&[WEB_AUDIENCE]);
    decode::<WebClaims>(token, &key, &validation).ok().map(|data| data.claims)
}

/// Legacy anchor JWT, kept for parity with anchors minted before the opaque
/// bearer-token pair existed.
fn verify_anchor_legacy_jwt(config: &OrbitConfig, token: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct AnchorClaims {
        sub: String,
    }
    let key = DecodingKey::from_secret(config.auth.anchor_jwt_secret.expose_secret().as_bytes());
    let mut validation = Validation::default();
    validation.set_issuer(&[ANCHOR_ISSUER]);
    validation.set_audience(&[ANCHOR_AUDIENCE]);
    decode::<AnchorClaims>(token, &key, &validation).ok().map(|data| data.claims.sub)
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Resolve the authenticated web user from a bearer token, confirming the
/// session named by `jti` is still active and owned by `sub`.
pub async fn authenticate_web(state: &AppState, token: &str) -> Option<String> {
    let claims = verify_web_token(&state.config, token)?;
    let session = state.hub.storage().get_active_session(&claims.jti).await.ok()??;
    if session.user_id != claims.sub {
        return None;
    }
    Some(claims.sub)
}

/// Resolve the authenticated anchor's user id, trying the opaque bearer
/// token first, then the legacy JWT.
pub async fn authenticate_anchor(state: &AppState, token: &str) -> Option<String> {
    if let Ok(Some(session)) = state.hub.storage().get_active_anchor_session_by_access_token(token).await {
        return Some(session.user_id);
    }
    verify_anchor_legacy_jwt(&state.config, token)
}

fn user_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::rng();
    let raw: String = (0..8).map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char).collect();
    format!("{}-{}", &raw[..4], &raw[4..])
}

fn device_code() -> String {
    orbit_common::random_hex_128()
}

// --- HTTP handlers, mounted under the auth collaborator's routes ---

pub async fn session(headers: HeaderMap, State(state): State<AppState>) -> impl IntoResponse {
    let token = bearer_from_headers(&headers);
    let user_id = match token {
        Some(t) => authenticate_web(&state, &t).await,
        None => None,
    };
    Json(json!({
        "authenticated": user_id.is_some(),
        "user": user_id.map(|id| json!({ "id": id })),
    }))
}

#[derive(Deserialize)]
pub struct BasicAuthPayload {
    #[serde(alias = "username")]
    name: String,
}

async fn issue_web_session(state: &AppState, user_id: &str) -> anyhow::Result<Value> {
    let (session, refresh_token) =
        state.hub.storage().create_session(user_id, state.config.auth.access_ttl_sec as i64, state.config.auth.refresh_ttl_sec as i64).await?;
    let token = mint_web_token(&state.config, user_id, &session.id)?;
    Ok(json!({
        "verified": true,
        "token": token,
        "refreshToken": refresh_token,
        "user": { "id": user_id },
    }))
}

/// The `basic` auth mode treats the supplied name as the user id directly;
/// there is no separate user directory to register into.
pub async fn register_basic(
    State(state): State<AppState>,
    Json(payload): Json<BasicAuthPayload>,
) -> impl IntoResponse {
    login_basic(State(state), Json(payload)).await.into_response()
}

pub async fn login_basic(State(state): State<AppState>, Json(payload): Json<BasicAuthPayload>) -> impl IntoResponse {
    let name = payload.name.trim();
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "name is required" }))).into_response();
    }
    match issue_web_session(&state, name).await {
        Ok(body) => Json(body).into_response(),
        Err(error) => {
            tracing::debug!(%error, "failed to create web session");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to create session" }))).into_response()
        }
    }
}

pub async fn logout(headers: HeaderMap, State(state): State<AppState>) -> impl IntoResponse {
    if let Some(token) = bearer_from_headers(&headers) {
        if let Some(claims) = verify_web_token(&state.config, &token) {
            let _ = state.hub.storage().revoke_session(&claims.jti).await;
        }
    }
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
pub struct RefreshPayload {
    #[serde(rename = "refreshToken")]
    refresh_token: String,
}

pub async fn refresh(State(state): State<AppState>, Json(payload): Json<RefreshPayload>) -> impl IntoResponse {
    let rotated = state
        .hub
        .storage()
        .rotate_refresh(&payload.refresh_token, state.config.auth.access_ttl_sec as i64, state.config.auth.refresh_ttl_sec as i64)
        .await;
    match rotated {
        Ok(Some((session, refresh_token))) => {
            match mint_web_token(&state.config, &session.user_id, &session.id) {
                Ok(token) => Json(json!({
                    "token": token,
                    "refreshToken": refresh_token,
                    "user": { "id": session.user_id },
                }))
                .into_response(),
                Err(error) => {
                    tracing::debug!(%error, "failed to mint refreshed token");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Ok(None) => {
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid or expired refresh token" }))).into_response()
        }
        Err(error) => {
            tracing::debug!(%error, "refresh lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn device_code_start(State(state): State<AppState>) -> impl IntoResponse {
    for _ in 0..8 {
        let user_code = user_code();
        let device_code = device_code();
        if state
            .hub
            .storage()
            .create_device_code(&device_code, &user_code, state.config.auth.device_code_ttl_sec as i64)
            .await
            .is_ok()
        {
            return Json(json!({
                "deviceCode": device_code,
                "userCode": user_code,
                "verificationUrl": state.config.auth.device_verification_url,
                "expiresIn": state.config.auth.device_code_ttl_sec,
                "interval": state.config.auth.device_poll_interval_sec,
            }))
            .into_response();
        }
    }
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to create device code" }))).into_response()
}

#[derive(Deserialize)]
pub struct DeviceAuthorisePayload {
    #[serde(rename = "userCode")]
    user_code: String,
}

pub async fn device_authorise(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(payload): Json<DeviceAuthorisePayload>,
) -> impl IntoResponse {
    let Some(token) = bearer_from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "authentication required" }))).into_response();
    };
    let Some(user_id) = authenticate_web(&state, &token).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "authentication required" }))).into_response();
    };

    let user_code = payload.user_code.trim().to_uppercase();
    if user_code.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "userCode is required" }))).into_response();
    }
    match state.hub.storage().authorize_device_code(&user_code, &user_id).await {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => (StatusCode::BAD_REQUEST, Json(json!({ "error": "code expired or not found" }))).into_response(),
        Err(error) => {
            tracing::debug!(%error, "device authorise failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct DeviceTokenPayload {
    #[serde(rename = "deviceCode")]
    device_code: String,
}

pub async fn device_poll(State(state): State<AppState>, Json(payload): Json<DeviceTokenPayload>) -> impl IntoResponse {
    let record = match state.hub.storage().consume_device_code(&payload.device_code).await {
        Ok(record) => record,
        Err(error) => {
            tracing::debug!(%error, "device poll lookup failed");
            return Json(json!({ "status": "expired" })).into_response();
        }
    };
    let Some(record) = record else {
        return Json(json!({ "status": "expired" })).into_response();
    };
    let Some(user_id) = (record.status == "authorised").then_some(record.user_id).flatten() else {
        return Json(json!({ "status": "pending" })).into_response();
    };

    match state
        .hub
        .storage()
        .create_anchor_session(&user_id, state.config.auth.anchor_access_ttl_sec as i64, state.config.auth.anchor_refresh_ttl_sec as i64)
        .await
    {
        Ok((session, access_token, refresh_token)) => Json(json!({
            "status": "authorised",
            "userId": user_id,
            "anchorAccessToken": access_token,
            "anchorRefreshToken": refresh_token,
            "anchorAccessExpiresIn": (session.access_expires_at - now_sec() as i64).max(0),
        }))
        .into_response(),
        Err(error) => {
            tracing::debug!(%error, "failed to mint anchor session");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn device_refresh(State(state): State<AppState>, Json(payload): Json<RefreshPayload>) -> impl IntoResponse {
    let rotated = state
        .hub
        .storage()
        .rotate_anchor_refresh(
            &payload.refresh_token,
            state.config.auth.anchor_access_ttl_sec as i64,
            state.config.auth.anchor_refresh_ttl_sec as i64,
        )
        .await;
    match rotated {
        Ok(Some((session, access_token, refresh_token))) => Json(json!({
            "anchorAccessToken": access_token,
            "anchorRefreshToken": refresh_token,
            "anchorAccessExpiresIn": (session.access_expires_at - now_sec() as i64).max(0),
        }))
        .into_response(),
        Ok(None) => {
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid or expired refresh token" }))).into_response()
        }
        Err(error) => {
            tracing::debug!(%error, "anchor refresh lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// WebAuthn ceremony verification is not reimplemented here; these routes
/// exist so a passkey-mode client gets a clean, stable response rather than
/// a 404.
pub async fn passkey_not_implemented() -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, Json(json!({ "error": "passkey flow is not implemented by this gateway" })))
}
