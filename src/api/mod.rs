use crate::{
    auth::{auth_middleware, create_auth_state},
    config::{ApiConfig, Config},
    models::{Step, WorkflowStatus},
    orchestrator::Orchestrator,
    rate_limit::{rate_limit_middleware, RateLimitConfig},
    runtime::RuntimeFacade,
    transport::{AgentInfo, SkillInfo, SubmitTaskRequest, TaskState},
    validation::TaskContentValidator,
    Result, SpiralError,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use validator::Validate;

const SERVICE_NAME: &str = "spiral-orchestrator";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    runtime: Arc<RuntimeFacade>,
    orchestrator: Arc<Orchestrator>,
    validator: Arc<TaskContentValidator>,
    rate_limiter: RateLimitConfig,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTaskRequest {
    pub role: Option<String>,
    #[validate(length(min = 1, max = 10000, message = "description must be 1-10000 characters"))]
    pub description: String,
    pub context: Option<HashMap<String, String>>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub steps: Vec<Step>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelTaskRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateWorkflowResponse {
    pub workflow_id: String,
}

#[derive(Debug, Serialize)]
pub struct WorkflowStatusResponse {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub tasks: Vec<TaskState>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiServer {
    pub fn new(config: Config, runtime: Arc<RuntimeFacade>, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let validator = Arc::new(TaskContentValidator::new()?);
        Ok(Self {
            config: config.api,
            runtime,
            orchestrator,
            validator,
            rate_limiter: RateLimitConfig::new(),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
            .await
            .map_err(|e| SpiralError::Internal(e.into()))?;

        info!(host = %self.config.host, port = self.config.port, "API server listening");

        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await
            .map_err(|e| SpiralError::Internal(e.into()))?;

        Ok(())
    }

    /// Rate limit -> auth -> trace -> CORS -> routes.
    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ])
            .max_age(std::time::Duration::from_secs(3600));

        Router::new()
            .route("/health", get(health_check))
            .route("/tasks", post(create_task))
            .route("/tasks/{task_id}", get(get_task_status))
            .route("/tasks/{task_id}/cancel", post(cancel_task))
            .route("/workflows", post(create_workflow))
            .route("/workflows/{workflow_id}", get(get_workflow_status))
            .route("/workflows/{workflow_id}/cancel", post(cancel_workflow))
            .route("/agents", get(list_agents))
            .route("/skills", get(list_skills))
            .route("/system/status", get(get_system_status))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(self.rate_limiter.clone(), rate_limit_middleware))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "service": SERVICE_NAME}))
}

fn internal_error() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: "Internal server error".to_string(), details: None }),
    )
}

async fn create_task(
    State(api_server): State<ApiServer>,
    Json(request): Json<CreateTaskRequest>,
) -> std::result::Result<(StatusCode, Json<TaskState>), (StatusCode, Json<ErrorResponse>)> {
    request.validate().map_err(|e| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: "Invalid request".to_string(), details: Some(e.to_string()) }))
    })?;

    let sanitized_description = api_server
        .validator
        .validate_and_sanitize_task_content(&request.description)
        .map_err(|_| {
            warn!("task content validation failed");
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: "Invalid task content".to_string(), details: None }))
        })?;

    let mut context = HashMap::new();
    if let Some(raw_context) = request.context {
        for (key, value) in raw_context {
            api_server.validator.validate_context_key(&key).map_err(|_| {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: "Invalid context key".to_string(), details: None }))
            })?;
            let sanitized_value = api_server.validator.validate_and_sanitize_context_value(&value).map_err(|_| {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: "Invalid context value".to_string(), details: None }))
            })?;
            context.insert(key, sanitized_value);
        }
    }

    let state = api_server
        .runtime
        .submit_task(SubmitTaskRequest { role: request.role, description: sanitized_description, context, session_id: request.session_id })
        .await
        .map_err(|e| match e {
            SpiralError::PermissionDenied(reason) => {
                (StatusCode::FORBIDDEN, Json(ErrorResponse { error: "Permission denied".to_string(), details: Some(reason) }))
            }
            e => {
                warn!(error = %e, "failed to submit task");
                internal_error()
            }
        })?;

    Ok((StatusCode::CREATED, Json(state)))
}

async fn get_task_status(
    State(api_server): State<ApiServer>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<TaskState>, (StatusCode, Json<ErrorResponse>)> {
    match api_server.runtime.query_task_state(&task_id).await {
        Ok(Some(state)) => Ok(Json(state)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse { error: "Task not found".to_string(), details: Some(format!("task id: {task_id}")) }),
        )),
        Err(e) => {
            warn!(error = %e, "failed to query task state");
            Err(internal_error())
        }
    }
}

async fn cancel_task(
    State(api_server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(request): Json<CancelTaskRequest>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match api_server.runtime.cancel_task(&task_id, request.session_id.as_deref()).await {
        Ok(cancelled) => Ok(Json(serde_json::json!({"cancelled": cancelled}))),
        Err(SpiralError::PermissionDenied(reason)) => {
            Err((StatusCode::FORBIDDEN, Json(ErrorResponse { error: "Permission denied".to_string(), details: Some(reason) })))
        }
        Err(e) => {
            warn!(error = %e, "failed to cancel task");
            Err(internal_error())
        }
    }
}

async fn create_workflow(
    State(api_server): State<ApiServer>,
    Json(request): Json<CreateWorkflowRequest>,
) -> std::result::Result<(StatusCode, Json<CreateWorkflowResponse>), (StatusCode, Json<ErrorResponse>)> {
    let workflow_id = api_server.orchestrator.create_workflow(request.steps).await.map_err(|e| {
        warn!(error = %e, "failed to create workflow");
        (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string(), details: None }))
    })?;

    let orchestrator = api_server.orchestrator.clone();
    let dispatch_id = workflow_id.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.execute_workflow(&dispatch_id).await {
            warn!(workflow_id = %dispatch_id, error = %e, "workflow execution ended in error");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(CreateWorkflowResponse { workflow_id })))
}

async fn get_workflow_status(
    State(api_server): State<ApiServer>,
    Path(workflow_id): Path<String>,
) -> std::result::Result<Json<WorkflowStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    match api_server.orchestrator.get_workflow(&workflow_id).await {
        Some(workflow) => {
            let tasks = workflow
                .task_order
                .iter()
                .filter_map(|id| workflow.tasks.get(id))
                .map(|t| TaskState { id: t.id.clone(), status: t.status, progress: t.progress, output: t.output.clone(), error: t.error.clone() })
                .collect();
            Ok(Json(WorkflowStatusResponse { workflow_id, status: workflow.status, tasks }))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse { error: "Workflow not found".to_string(), details: Some(format!("workflow id: {workflow_id}")) }),
        )),
    }
}

async fn cancel_workflow(
    State(api_server): State<ApiServer>,
    Path(workflow_id): Path<String>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    api_server.orchestrator.cancel_workflow(&workflow_id).await.map_err(|e| {
        warn!(error = %e, "failed to cancel workflow");
        (StatusCode::NOT_FOUND, Json(ErrorResponse { error: e.to_string(), details: None }))
    })?;
    Ok(Json(serde_json::json!({"cancelled": true})))
}

async fn list_agents(
    State(api_server): State<ApiServer>,
) -> std::result::Result<Json<Vec<AgentInfo>>, StatusCode> {
    api_server.runtime.list_agents().await.map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn list_skills(
    State(api_server): State<ApiServer>,
) -> std::result::Result<Json<Vec<SkillInfo>>, StatusCode> {
    api_server.runtime.list_skills().await.map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn get_system_status(
    State(api_server): State<ApiServer>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    let status = api_server.runtime.get_status().await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    serde_json::to_value(status).map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskEngine;
    use crate::runtime::DeploymentMode;
    use crate::store::InMemoryTaskStore;
    use crate::transport::local::{LocalTransportAdapter, SpawnOutcome, SpawnRequest, SubagentSpawner};
    use crate::transport::TransportAdapter;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct AlwaysAccept;
    #[async_trait]
    impl SubagentSpawner for AlwaysAccept {
        async fn spawn(&self, _req: SpawnRequest) -> Result<SpawnOutcome> {
            Ok(SpawnOutcome::Accepted { child_session_key: None })
        }
    }

    fn test_server() -> ApiServer {
        let store: Arc<dyn crate::store::TaskStore> = Arc::new(InMemoryTaskStore::new());
        let engine = Arc::new(TaskEngine::new(store.clone()));
        let spawner: Arc<dyn SubagentSpawner> = Arc::new(AlwaysAccept);
        let adapter: Arc<dyn TransportAdapter> = Arc::new(LocalTransportAdapter::new(engine.clone(), spawner.clone(), vec![], vec![]));
        let runtime = Arc::new(RuntimeFacade::new(adapter, DeploymentMode::LocalOnly, Some(store)));
        let orchestrator = Arc::new(Orchestrator::new(engine, spawner, Arc::new(crate::roles::RoleRegistry::with_builtins())));

        let config = Config {
            runtime: crate::config::RuntimeConfig { mode: DeploymentMode::LocalOnly, project_dir: ".".to_string() },
            transport: crate::config::TransportConfig { remote_base_url: None, poll_interval_ms: 1000, request_timeout_secs: 30 },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                api_key: Some("test-key-that-is-at-least-32-chars-long".to_string()),
                enable_auth: true,
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
        };

        ApiServer::new(config, runtime, orchestrator).unwrap()
    }

    #[tokio::test]
    async fn health_check_requires_no_auth() {
        let app = test_server().build_router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn task_submission_without_api_key_is_rejected() {
        let app = test_server().build_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"description": "do something"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn task_submission_with_valid_key_returns_pending() {
        let app = test_server().build_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .header("x-api-key", "test-key-that-is-at-least-32-chars-long")
                    .body(Body::from(r#"{"description": "do something"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn dangerous_task_content_is_rejected() {
        let app = test_server().build_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .header("x-api-key", "test-key-that-is-at-least-32-chars-long")
                    .body(Body::from(r#"{"description": "rm -rf / && echo done"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_description_is_rejected_by_request_validation() {
        let app = test_server().build_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .header("x-api-key", "test-key-that-is-at-least-32-chars-long")
                    .body(Body::from(r#"{"description": ""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
