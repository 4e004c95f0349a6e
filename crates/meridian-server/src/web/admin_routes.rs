//! Token-gated admin surface: runtime config, probe administration, and
//! shared-secret rotation. Login exchanges the admin password for a signed
//! bearer token carrying `{sub: "admin", exp}`.

use super::error::AppError;
use super::task_routes::{normalize_blocked_networks, parse_blocked_networks};
use super::AppState;
use crate::db::{probes, results};
use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const TOKEN_TTL_HOURS: i64 = 24;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let authed = Router::new()
        .route("/generate-secret", get(generate_secret))
        .route("/config", get(get_config).put(update_config))
        .route("/probes/{id}", put(update_probe).delete(delete_probe))
        .layer(axum::middleware::from_fn_with_state(state, admin_auth));

    Router::new().route("/login", post(login)).merge(authed)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn sign_admin_token(jwt_secret: &str, ttl: Duration) -> Result<String, AppError> {
    let claims = Claims {
        sub: "admin".to_string(),
        exp: (Utc::now() + ttl).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("failed to generate token: {e}")))
}

pub fn verify_admin_token(token: &str, jwt_secret: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
    .filter(|claims| claims.sub == "admin")
}

async fn admin_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized".to_string()))?;

    verify_admin_token(token, &state.config.jwt_secret)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized".to_string()))?;

    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, AppError> {
    if state.config.admin_password.is_empty() {
        return Err(AppError::Internal("Admin password not configured".to_string()));
    }
    if req.password != state.config.admin_password {
        return Err(AppError::Unauthorized("Invalid password".to_string()));
    }

    let token = sign_admin_token(&state.config.jwt_secret, Duration::hours(TOKEN_TTL_HOURS))?;
    Ok(Json(json!({ "success": true, "token": token })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfigRequest {
    pub shared_secret: String,
    pub blocked_networks: String,
    pub ping_max_runs: i64,
    pub tcp_ping_max_runs: i64,
    pub traceroute_timeout_seconds: i64,
}

async fn get_config(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let mut shared_secret = results::get_config(&state.db, "shared_secret")
        .await
        .unwrap_or_default();
    if shared_secret.is_empty() {
        shared_secret = state.config.shared_secret.clone();
    }

    let fetch = |key: &'static str| {
        let db = state.db.clone();
        async move { results::get_config(&db, key).await.unwrap_or_default() }
    };

    Ok(Json(json!({
        "shared_secret": shared_secret,
        "blocked_networks": fetch("blocked_networks").await,
        "ping_max_runs": fetch("ping_max_runs").await,
        "tcp_ping_max_runs": fetch("tcp_ping_max_runs").await,
        "traceroute_timeout_seconds": fetch("traceroute_timeout_seconds").await,
    })))
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdminConfigRequest>,
) -> Result<Json<Value>, AppError> {
    // An empty shared secret is allowed; clearing it falls back to the
    // static config value.
    results::set_config(&state.db, "shared_secret", &req.shared_secret).await?;

    let blocked = normalize_blocked_networks(&req.blocked_networks);
    if !blocked.is_empty() && parse_blocked_networks(&blocked).is_err() {
        return Err(AppError::InvalidInput("Invalid blocked_networks".to_string()));
    }
    results::set_config(&state.db, "blocked_networks", &blocked).await?;

    // Numeric knobs: zero or negative means "leave the stored value alone".
    for (key, value) in [
        ("ping_max_runs", req.ping_max_runs),
        ("tcp_ping_max_runs", req.tcp_ping_max_runs),
        ("traceroute_timeout_seconds", req.traceroute_timeout_seconds),
    ] {
        if value > 0 {
            results::set_config(&state.db, key, &value.to_string()).await?;
        }
    }

    // Let connected probes pick up runtime knobs without a reconnect.
    state
        .hub
        .broadcast(meridian_proto::MSG_CONFIG, meridian_proto::SessionConfig::default())
        .await;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProbeRequest {
    #[serde(default)]
    pub name: String,
}

async fn update_probe(
    State(state): State<Arc<AppState>>,
    Path(probe_id): Path<String>,
    Json(req): Json<UpdateProbeRequest>,
) -> Result<Json<Value>, AppError> {
    let mut probe = probes::get_probe(&state.db, &probe_id).await?;
    let name = req.name.trim();
    if !name.is_empty() {
        probe.name = name.to_string();
    }
    probes::save_probe(&state.db, &probe).await?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_probe(
    State(state): State<Arc<AppState>>,
    Path(probe_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    probes::delete_probe(&state.db, &probe_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn generate_secret() -> Result<Json<Value>, AppError> {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Ok(Json(json!({ "shared_secret": URL_SAFE_NO_PAD.encode(bytes) })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let token = sign_admin_token("jwt-secret", Duration::hours(1)).unwrap();
        let claims = verify_admin_token(&token, "jwt-secret").unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.exp > Utc::now().timestamp() as usize);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = sign_admin_token("jwt-secret", Duration::hours(1)).unwrap();
        assert!(verify_admin_token(&token, "other-secret").is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        // Well past the default validation leeway.
        let token = sign_admin_token("jwt-secret", Duration::hours(-2)).unwrap();
        assert!(verify_admin_token(&token, "jwt-secret").is_none());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(verify_admin_token("not.a.jwt", "jwt-secret").is_none());
        assert!(verify_admin_token("", "jwt-secret").is_none());
    }
}
