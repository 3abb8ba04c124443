use anyhow::Result;
use spiral_orchestrator::api::ApiServer;
use spiral_orchestrator::config::Config;
use spiral_orchestrator::engine::TaskEngine;
use spiral_orchestrator::orchestrator::Orchestrator;
use spiral_orchestrator::roles::RoleRegistry;
use spiral_orchestrator::runtime::{DeploymentMode, RuntimeFacade};
use spiral_orchestrator::security::SecurityService;
use spiral_orchestrator::store::{InMemoryTaskStore, TaskStore};
use spiral_orchestrator::transport::local::{ClaudeCliSubagentSpawner, LocalTransportAdapter, SubagentSpawner};
use spiral_orchestrator::transport::remote::RemoteTransportAdapter;
use spiral_orchestrator::transport::{AgentInfo, TransportAdapter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    info!("starting orchestrator runtime");

    let config = Config::load()?;
    let mut roles = RoleRegistry::with_builtins();
    let loaded = roles.load_custom_roles(std::path::Path::new(&config.runtime.project_dir)).await?;
    info!(custom_roles_loaded = loaded, "role registry ready");
    let roles = Arc::new(roles);

    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let engine = Arc::new(TaskEngine::new(store.clone()));
    let spawner: Arc<dyn SubagentSpawner> = Arc::new(ClaudeCliSubagentSpawner::new().await?);

    let (adapter, store_for_facade): (Arc<dyn TransportAdapter>, Option<Arc<dyn TaskStore>>) = match config.runtime.mode {
        DeploymentMode::LocalOnly => {
            let agents: Vec<AgentInfo> = roles
                .list()
                .into_iter()
                .map(|r| AgentInfo { id: r.name.clone(), name: r.name.clone() })
                .collect();
            (
                Arc::new(LocalTransportAdapter::new(engine.clone(), spawner.clone(), agents, vec![])),
                Some(store.clone()),
            )
        }
        DeploymentMode::RemoteEnabled | DeploymentMode::DistributedCluster => {
            let base_url = config
                .transport
                .remote_base_url
                .clone()
                .expect("Config::load validates remote_base_url is set in remote modes");
            (
                Arc::new(
                    RemoteTransportAdapter::new(base_url, None, None)
                        .with_poll_interval(Duration::from_millis(config.transport.poll_interval_ms))
                        .with_request_timeout(Duration::from_secs(config.transport.request_timeout_secs)),
                ),
                None,
            )
        }
    };

    let security = Arc::new(SecurityService::new());
    let runtime = Arc::new(RuntimeFacade::new(adapter, config.runtime.mode, store_for_facade).with_security(security));
    let orchestrator = Arc::new(Orchestrator::new(engine, spawner, roles));
    let api_server = ApiServer::new(config, runtime, orchestrator)?;

    if let Err(e) = api_server.run().await {
        tracing::error!("API server failed: {}", e);
    }

    Ok(())
}
