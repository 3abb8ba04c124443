use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::claude_code::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::constants::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::error::{Result, SpiralError};
use crate::models::TaskStatus;
use crate::transport::{
    AgentInfo, SkillInfo, SubmitTaskRequest, TaskState, TaskUpdate, TransportAdapter,
    UpdateIterator,
};

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
    #[allow(dead_code)]
    user_id: Option<String>,
    #[allow(dead_code)]
    created_at: Option<String>,
    #[allow(dead_code)]
    last_activity: Option<String>,
    #[allow(dead_code)]
    permissions: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    agent_type: &'a Option<String>,
    prompt: &'a str,
    context: &'a HashMap<String, String>,
    session_id: &'a str,
}

#[derive(Debug, Deserialize, Clone)]
struct TaskStateResponse {
    task_id: String,
    #[allow(dead_code)]
    execution_uuid: Option<String>,
    state: TaskStatus,
    #[allow(dead_code)]
    success: Option<bool>,
    result: Option<String>,
    error: Option<String>,
    #[allow(dead_code)]
    execution_time: Option<f64>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    success: bool,
    #[allow(dead_code)]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    agent_type: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SkillResponse {
    skill_id: String,
    name: Option<String>,
}

impl From<TaskStateResponse> for TaskState {
    fn from(r: TaskStateResponse) -> Self {
        let progress = if r.state == TaskStatus::Completed { 100 } else { 0 };
        TaskState {
            id: r.task_id,
            status: r.state,
            progress,
            output: r.result,
            error: r.error,
        }
    }
}

/// HTTP polling client against an external execution node. State is held
/// behind an `RwLock` because `connect`/`close` mutate the cached session id
/// while reads (submit/query/cancel) only need it.
pub struct RemoteTransportAdapter {
    base_url: String,
    user_id: Option<String>,
    device_id: Option<String>,
    poll_interval: Duration,
    request_timeout: Duration,
    client: reqwest::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    session_id: RwLock<Option<String>>,
}

impl RemoteTransportAdapter {
    pub fn new(base_url: impl Into<String>, user_id: Option<String>, device_id: Option<String>) -> Self {
        let request_timeout = Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client config is valid");

        Self {
            base_url: base_url.into(),
            user_id,
            device_id,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout,
            client,
            circuit_breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            session_id: RwLock::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client config is valid");
        self
    }

    /// Idempotent: a second call without an intervening `close()` is a no-op.
    pub async fn connect(&self) -> Result<String> {
        if let Some(existing) = self.session_id.read().await.clone() {
            return Ok(existing);
        }

        if !self.circuit_breaker.should_allow_request().await {
            return Err(SpiralError::TransportUnavailable(
                "circuit breaker open for remote execution node".to_string(),
            ));
        }

        let mut url = format!("{}/api/runtime/sessions", self.base_url);
        let mut query = Vec::new();
        if let Some(user_id) = &self.user_id {
            query.push(format!("user_id={user_id}"));
        }
        if let Some(device_id) = &self.device_id {
            query.push(format!("device_id={device_id}"));
        }
        if !query.is_empty() {
            url = format!("{url}?{}", query.join("&"));
        }

        let response = self.client.post(&url).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                self.circuit_breaker.record_success().await;
                let body: SessionResponse = resp.json().await.map_err(SpiralError::from)?;
                *self.session_id.write().await = Some(body.session_id.clone());
                Ok(body.session_id)
            }
            Ok(resp) => {
                self.circuit_breaker.record_failure().await;
                Err(SpiralError::TransportUnavailable(format!(
                    "session create returned status {}",
                    resp.status()
                )))
            }
            Err(e) => {
                self.circuit_breaker.record_failure().await;
                Err(SpiralError::TransportUnavailable(e.to_string()))
            }
        }
    }

    async fn ensure_session(&self) -> Result<String> {
        match self.session_id.read().await.clone() {
            Some(id) => Ok(id),
            None => self.connect().await,
        }
    }
}

/// Adds up to 10% random jitter to a poll interval so many streamed tasks
/// against the same execution node don't all land on the same tick.
fn jittered(interval: Duration) -> Duration {
    let jitter_ratio: f64 = rand::thread_rng().gen_range(0.0..0.1);
    interval + Duration::from_secs_f64(interval.as_secs_f64() * jitter_ratio)
}

struct RemotePollIterator {
    client: reqwest::Client,
    base_url: String,
    task_id: String,
    poll_interval: Duration,
    last_status: Option<TaskStatus>,
    done: bool,
}

#[async_trait]
impl UpdateIterator for RemotePollIterator {
    async fn next(&mut self) -> Result<Option<TaskUpdate>> {
        if self.done {
            return Ok(None);
        }

        loop {
            tokio::time::sleep(jittered(self.poll_interval)).await;

            let url = format!("{}/api/runtime/tasks/{}/state", self.base_url, self.task_id);
            let response = self.client.get(&url).send().await;
            let body: TaskStateResponse = match response {
                Ok(resp) if resp.status().is_success() => {
                    resp.json().await.map_err(SpiralError::from)?
                }
                Ok(resp) => {
                    return Err(SpiralError::TransportUnavailable(format!(
                        "poll returned status {}",
                        resp.status()
                    )))
                }
                Err(e) => return Err(SpiralError::TransportUnavailable(e.to_string())),
            };

            if Some(body.state) == self.last_status {
                continue;
            }
            self.last_status = Some(body.state);

            let terminal = body.state.is_terminal();
            let progress = if body.state == TaskStatus::Completed { 100 } else { 0 };
            let update = TaskUpdate {
                id: body.task_id.clone(),
                status: body.state,
                progress,
            };

            if terminal {
                self.done = true;
            }
            return Ok(Some(update));
        }
    }
}

#[async_trait]
impl TransportAdapter for RemoteTransportAdapter {
    async fn submit_task(&self, req: SubmitTaskRequest) -> Result<TaskState> {
        let session_id = self.ensure_session().await?;

        let url = format!("{}/api/runtime/tasks/submit", self.base_url);
        let body = SubmitBody {
            agent_type: &req.role,
            prompt: &req.description,
            context: &req.context,
            session_id: &session_id,
        };

        let response = self.client.post(&url).json(&body).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                let state: TaskStateResponse = resp.json().await.map_err(SpiralError::from)?;
                Ok(state.into())
            }
            Ok(resp) => Err(SpiralError::TransportUnavailable(format!(
                "submit returned status {}",
                resp.status()
            ))),
            Err(e) => Err(SpiralError::TransportUnavailable(e.to_string())),
        }
    }

    async fn stream_task_updates(&self, id: &str) -> Result<Box<dyn UpdateIterator>> {
        // Seed `last_status` from the task's currently known state so the
        // first poll only yields if the status has actually moved on from
        // it, rather than always yielding on the first observation.
        let last_status = self.query_task_state(id).await?.map(|s| s.status);
        Ok(Box::new(RemotePollIterator {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            task_id: id.to_string(),
            poll_interval: self.poll_interval,
            last_status,
            done: false,
        }))
    }

    async fn query_task_state(&self, id: &str) -> Result<Option<TaskState>> {
        let url = format!("{}/api/runtime/tasks/{}/state", self.base_url, id);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<TaskStateResponse>().await {
                    Ok(body) => Ok(Some(body.into())),
                    Err(_) => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    async fn cancel_task(&self, id: &str) -> Result<bool> {
        let session_id = self.session_id.read().await.clone().unwrap_or_default();
        let url = format!("{}/api/runtime/tasks/{}/cancel", self.base_url, id);
        let body = serde_json::json!({ "session_id": session_id });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<CancelResponse>().await {
                    Ok(body) => Ok(body.success),
                    Err(_) => Ok(false),
                }
            }
            _ => Ok(false),
        }
    }

    async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        let session_id = self.ensure_session().await?;
        let url = format!("{}/api/runtime/agents?session_id={}", self.base_url, session_id);
        let resp = self.client.get(&url).send().await.map_err(SpiralError::from)?;
        if !resp.status().is_success() {
            return Err(SpiralError::TransportUnavailable(format!(
                "list agents returned status {}",
                resp.status()
            )));
        }
        let agents: Vec<AgentResponse> = resp.json().await.map_err(SpiralError::from)?;
        Ok(agents
            .into_iter()
            .map(|a| AgentInfo {
                name: a.name.clone().unwrap_or_else(|| a.agent_type.clone()),
                id: a.agent_type,
            })
            .collect())
    }

    async fn list_skills(&self) -> Result<Vec<SkillInfo>> {
        let session_id = self.ensure_session().await?;
        let url = format!("{}/api/runtime/skills?session_id={}", self.base_url, session_id);
        let resp = self.client.get(&url).send().await.map_err(SpiralError::from)?;
        if !resp.status().is_success() {
            return Err(SpiralError::TransportUnavailable(format!(
                "list skills returned status {}",
                resp.status()
            )));
        }
        let skills: Vec<SkillResponse> = resp.json().await.map_err(SpiralError::from)?;
        Ok(skills
            .into_iter()
            .map(|s| SkillInfo {
                name: s.name.clone().unwrap_or_else(|| s.skill_id.clone()),
                id: s.skill_id,
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        debug!("closing remote transport, clearing cached session (best-effort, no server revoke)");
        *self.session_id.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn connect_is_idempotent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", mockito::Matcher::Regex("^/api/runtime/sessions".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"session_id":"sess-1","user_id":null,"created_at":null,"last_activity":null,"permissions":null}"#)
            .expect(1)
            .create_async()
            .await;

        let adapter = RemoteTransportAdapter::new(server.url(), None, None);
        let first = adapter.connect().await.unwrap();
        let second = adapter.connect().await.unwrap();
        assert_eq!(first, second);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn query_task_state_returns_none_on_non_2xx() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/runtime/tasks/abc/state")
            .with_status(500)
            .create_async()
            .await;

        let adapter = RemoteTransportAdapter::new(server.url(), None, None);
        let result = adapter.query_task_state("abc").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cancel_task_returns_false_on_non_2xx() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/runtime/tasks/abc/cancel")
            .with_status(404)
            .create_async()
            .await;

        let adapter = RemoteTransportAdapter::new(server.url(), None, None);
        assert!(!adapter.cancel_task("abc").await.unwrap());
    }

    #[tokio::test]
    async fn stream_yields_one_update_per_status_change_and_stops_on_terminal() {
        let mut server = Server::new_async().await;
        // Served in reverse registration order: mockito matches the most
        // recently created still-active mock first, falling back to older
        // ones as each is exhausted. Registering in reverse makes the four
        // GETs (seed, then the three polls) observe this exact sequence.
        let responses = [
            r#"{"task_id":"t1","state":"pending","success":null,"result":null,"error":null}"#,
            r#"{"task_id":"t1","state":"pending","success":null,"result":null,"error":null}"#,
            r#"{"task_id":"t1","state":"running","success":null,"result":null,"error":null}"#,
            r#"{"task_id":"t1","state":"completed","success":true,"result":"done","error":null}"#,
        ];
        for body in responses.iter().rev() {
            server
                .mock("GET", "/api/runtime/tasks/t1/state")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(*body)
                .expect(1)
                .create_async()
                .await;
        }

        let adapter = RemoteTransportAdapter::new(server.url(), None, None)
            .with_poll_interval(Duration::from_millis(1));
        let mut stream = adapter.stream_task_updates("t1").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Running);

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Completed);
        assert_eq!(second.progress, 100);

        assert!(stream.next().await.unwrap().is_none());
    }
}
