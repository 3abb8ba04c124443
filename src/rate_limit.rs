use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 60;
pub const TASK_REQUESTS_PER_MINUTE: u32 = 10;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub general_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    pub task_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        let general_quota = Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap());
        let task_quota = Quota::per_minute(NonZeroU32::new(TASK_REQUESTS_PER_MINUTE).unwrap());

        Self {
            general_limiter: Arc::new(RateLimiter::direct(general_quota)),
            task_limiter: Arc::new(RateLimiter::direct(task_quota)),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the stricter task-submission quota to `POST /tasks*`, the general
/// quota to everything else. Global, not per-IP — see `extract_client_ip` for
/// the hook a per-IP keyed limiter would use.
pub async fn rate_limit_middleware(
    axum::extract::State(config): axum::extract::State<RateLimitConfig>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let is_task_submission = request.uri().path().starts_with("/tasks") && request.method() == "POST";

    let limiter = if is_task_submission {
        &config.task_limiter
    } else {
        &config.general_limiter
    };

    if limiter.check().is_err() {
        warn!(path = %request.uri().path(), "request rejected by rate limiter");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

pub fn extract_client_ip(request: &Request) -> String {
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(ip_str) = forwarded_for.to_str() {
            if let Some(first_ip) = ip_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }

    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiters_allow_initial_requests() {
        let config = RateLimitConfig::new();
        assert!(config.general_limiter.check().is_ok());
        assert!(config.task_limiter.check().is_ok());
    }

    #[test]
    fn task_quota_exhausts_before_general_quota() {
        let config = RateLimitConfig::new();
        for _ in 0..TASK_REQUESTS_PER_MINUTE {
            assert!(config.task_limiter.check().is_ok());
        }
        assert!(config.task_limiter.check().is_err());
        assert!(config.general_limiter.check().is_ok());
    }
}
