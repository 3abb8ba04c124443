use std::env;

use serde::{Deserialize, Serialize};

use crate::runtime::DeploymentMode;
use crate::{Result, SpiralError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub transport: TransportConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub mode: DeploymentMode,
    pub project_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Only required when `mode` is `remote-enabled` or `distributed-cluster`.
    pub remote_base_url: Option<String>,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {e}"),
        }

        let mode = match env::var("RUNTIME_MODE").unwrap_or_else(|_| "local-only".to_string()).as_str() {
            "local-only" => DeploymentMode::LocalOnly,
            "remote-enabled" => DeploymentMode::RemoteEnabled,
            "distributed-cluster" => DeploymentMode::DistributedCluster,
            other => {
                return Err(SpiralError::ConfigurationError(format!(
                    "RUNTIME_MODE must be one of local-only, remote-enabled, distributed-cluster (got {other})"
                )))
            }
        };

        let remote_base_url = env::var("REMOTE_BASE_URL").ok();
        if matches!(mode, DeploymentMode::RemoteEnabled | DeploymentMode::DistributedCluster) {
            match &remote_base_url {
                None => {
                    return Err(SpiralError::ConfigurationError(
                        "REMOTE_BASE_URL is required when RUNTIME_MODE is remote-enabled or distributed-cluster".to_string(),
                    ))
                }
                Some(url) => {
                    url::Url::parse(url).map_err(|e| {
                        SpiralError::ConfigurationError(format!("REMOTE_BASE_URL is not a valid URL: {e}"))
                    })?;
                }
            }
        }

        let runtime = RuntimeConfig {
            mode,
            project_dir: env::var("PROJECT_DIR").unwrap_or_else(|_| ".".to_string()),
        };

        let transport = TransportConfig {
            remote_base_url,
            poll_interval_ms: parse_or("POLL_INTERVAL_MS", 1000),
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", 30),
        };

        let api_key = env::var("API_KEY").ok();
        match &api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(SpiralError::ConfigurationError("API_KEY cannot be blank".to_string()));
            }
            Some(key) if key.len() < 32 => {
                return Err(SpiralError::ConfigurationError(
                    "API_KEY must be at least 32 characters".to_string(),
                ));
            }
            _ => {}
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_or("API_PORT", 3000),
            enable_auth: api_key.is_some(),
            api_key,
            allowed_origins,
        };

        Ok(Config { runtime, transport, api })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
