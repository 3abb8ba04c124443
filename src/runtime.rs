use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpiralError};
use crate::models::TaskStatus;
use crate::security::policy::Permission;
use crate::security::SecurityService;
use crate::store::{TaskFilter, TaskStore};
use crate::transport::{
    AgentInfo, SkillInfo, SubmitTaskRequest, TaskState, TransportAdapter, UpdateIterator,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    LocalOnly,
    RemoteEnabled,
    DistributedCluster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub version: String,
    pub uptime_seconds: u64,
    pub active_tasks: usize,
    pub total_tasks: u64,
    pub mode: DeploymentMode,
    pub healthy: bool,
}

/// The single front door that routes adapter operations, counts totals, and
/// reports health. Delegates every operation to the wrapped adapter, gating
/// `submit_task`/`cancel_task` through the Security Service first whenever a
/// session id travels with the request — every dispatch decision flows
/// through the authorization layer (spec §1, §2).
pub struct RuntimeFacade {
    adapter: Arc<dyn TransportAdapter>,
    mode: DeploymentMode,
    start_time: Instant,
    total_tasks: AtomicU64,
    /// Direct store handle for active-task accounting. Populated when the
    /// wrapped adapter is backed by an in-process store (local mode); absent
    /// for purely remote deployments, where active-task count reports 0.
    store: Option<Arc<dyn TaskStore>>,
    /// Absent in tests/CLI paths that submit without a session; present in
    /// the wired runtime (see `main.rs`).
    security: Option<Arc<SecurityService>>,
}

impl RuntimeFacade {
    pub fn new(adapter: Arc<dyn TransportAdapter>, mode: DeploymentMode, store: Option<Arc<dyn TaskStore>>) -> Self {
        Self {
            adapter,
            mode,
            start_time: Instant::now(),
            total_tasks: AtomicU64::new(0),
            store,
            security: None,
        }
    }

    pub fn with_security(mut self, security: Arc<SecurityService>) -> Self {
        self.security = Some(security);
        self
    }

    /// Authorizes `permission` against the session named by `session_id`, if
    /// both a security service and a session id are present. A request with
    /// no session id is not gated (unauthenticated CLI/test submission path);
    /// a request naming an unknown session is denied.
    async fn authorize(&self, session_id: Option<&str>, permission: Permission) -> Result<()> {
        let Some(security) = &self.security else { return Ok(()) };
        let Some(session_id) = session_id else { return Ok(()) };

        let session = security
            .get_session(session_id)
            .await?
            .ok_or_else(|| SpiralError::PermissionDenied(format!("unknown session {session_id}")))?;

        let result = security.check_permission(&session, permission).await?;
        if !result.allowed {
            return Err(SpiralError::PermissionDenied(
                result.reason.unwrap_or_else(|| format!("missing permission {}", permission.as_str())),
            ));
        }
        Ok(())
    }

    pub async fn submit_task(&self, req: SubmitTaskRequest) -> Result<TaskState> {
        self.authorize(req.session_id.as_deref(), Permission::TaskSubmit).await?;
        let result = self.adapter.submit_task(req).await?;
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    pub async fn stream_task_updates(&self, id: &str) -> Result<Box<dyn UpdateIterator>> {
        self.adapter.stream_task_updates(id).await
    }

    pub async fn query_task_state(&self, id: &str) -> Result<Option<TaskState>> {
        self.adapter.query_task_state(id).await
    }

    pub async fn cancel_task(&self, id: &str, session_id: Option<&str>) -> Result<bool> {
        self.authorize(session_id, Permission::TaskCancel).await?;
        self.adapter.cancel_task(id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        self.adapter.list_agents().await
    }

    pub async fn list_skills(&self) -> Result<Vec<SkillInfo>> {
        self.adapter.list_skills().await
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }

    pub async fn get_status(&self) -> Result<RuntimeStatus> {
        let active_tasks = match &self.store {
            Some(store) => store.list(&TaskFilter::by_status(TaskStatus::Running)).await?.len(),
            None => 0,
        };

        Ok(RuntimeStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            active_tasks,
            total_tasks: self.total_tasks.load(Ordering::Relaxed),
            mode: self.mode,
            healthy: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskEngine;
    use crate::store::InMemoryTaskStore;
    use crate::transport::local::{LocalTransportAdapter, SpawnOutcome, SpawnRequest, SubagentSpawner};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct AlwaysAccept;
    #[async_trait]
    impl SubagentSpawner for AlwaysAccept {
        async fn spawn(&self, _req: SpawnRequest) -> Result<SpawnOutcome> {
            Ok(SpawnOutcome::Accepted { child_session_key: None })
        }
    }

    #[tokio::test]
    async fn submit_task_increments_total_counter() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let engine = Arc::new(TaskEngine::new(store.clone()));
        let adapter: Arc<dyn TransportAdapter> =
            Arc::new(LocalTransportAdapter::new(engine, Arc::new(AlwaysAccept), vec![], vec![]));
        let facade = RuntimeFacade::new(adapter, DeploymentMode::LocalOnly, Some(store));

        facade
            .submit_task(SubmitTaskRequest {
                role: None,
                description: "a".to_string(),
                context: HashMap::new(),
                session_id: None,
            })
            .await
            .unwrap();
        facade
            .submit_task(SubmitTaskRequest {
                role: None,
                description: "b".to_string(),
                context: HashMap::new(),
                session_id: None,
            })
            .await
            .unwrap();

        let status = facade.get_status().await.unwrap();
        assert_eq!(status.total_tasks, 2);
        assert_eq!(status.mode, DeploymentMode::LocalOnly);
        assert!(status.healthy);
    }

    fn facade_with_security(security: Arc<crate::security::SecurityService>) -> RuntimeFacade {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let engine = Arc::new(TaskEngine::new(store.clone()));
        let adapter: Arc<dyn TransportAdapter> =
            Arc::new(LocalTransportAdapter::new(engine, Arc::new(AlwaysAccept), vec![], vec![]));
        RuntimeFacade::new(adapter, DeploymentMode::LocalOnly, Some(store)).with_security(security)
    }

    #[tokio::test]
    async fn submit_without_session_is_not_gated() {
        let security = Arc::new(crate::security::SecurityService::new());
        let facade = facade_with_security(security);
        let result = facade
            .submit_task(SubmitTaskRequest { role: None, description: "a".to_string(), context: HashMap::new(), session_id: None })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn submit_denied_without_task_submit_permission() {
        let security = Arc::new(crate::security::SecurityService::new());
        security.verify_device("d1", crate::security::identity::DeviceType::Desktop).await.unwrap();
        let session = security
            .create_session("u1".to_string(), "d1".to_string(), vec!["readonly".to_string()])
            .await
            .unwrap();
        let facade = facade_with_security(security);

        let result = facade
            .submit_task(SubmitTaskRequest {
                role: None,
                description: "a".to_string(),
                context: HashMap::new(),
                session_id: Some(session.id),
            })
            .await;
        assert!(matches!(result, Err(SpiralError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn submit_allowed_with_developer_permission() {
        let security = Arc::new(crate::security::SecurityService::new());
        security.verify_device("d1", crate::security::identity::DeviceType::Desktop).await.unwrap();
        let session = security
            .create_session("u1".to_string(), "d1".to_string(), vec!["developer".to_string()])
            .await
            .unwrap();
        let facade = facade_with_security(security);

        let result = facade
            .submit_task(SubmitTaskRequest {
                role: None,
                description: "a".to_string(),
                context: HashMap::new(),
                session_id: Some(session.id),
            })
            .await;
        assert!(result.is_ok());
    }
}
