use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
}

/// Accepts `x-api-key` or `Authorization: Bearer <key>`, compared against the
/// configured key in constant time. OPTIONS requests bypass auth so CORS
/// preflight succeeds, and `/health` is reachable unauthenticated so load
/// balancers and orchestrators can probe liveness without a key.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if request.method() == Method::OPTIONS
        || request.uri().path() == "/health"
        || !auth_state.config.enable_auth
    {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();
    let client_ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let provided_key = if let Some(header_value) = headers.get("x-api-key") {
        header_value.to_str().map_err(|_| {
            warn!(%client_ip, %path, "malformed x-api-key header");
            unauthorized()
        })?
    } else if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().map_err(|_| {
            warn!(%client_ip, %path, "malformed authorization header");
            unauthorized()
        })?;
        auth_str.strip_prefix("Bearer ").ok_or_else(|| {
            warn!(%client_ip, %path, "authorization header missing Bearer prefix");
            unauthorized()
        })?
    } else {
        warn!(%client_ip, %path, "missing API key");
        return Err(unauthorized());
    };

    match &auth_state.config.api_key {
        Some(expected_key) => {
            if provided_key.as_bytes().ct_eq(expected_key.as_bytes()).into() {
                Ok(next.run(request).await)
            } else {
                warn!(%client_ip, %path, "authentication failed: invalid key");
                Err(unauthorized())
            }
        }
        None => {
            warn!("API authentication enabled but no API key configured");
            Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "Internal Server Error"}))).into_response())
        }
    }
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}
