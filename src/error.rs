use thiserror::Error;

/// Convenience type alias for Results with SpiralError
pub type Result<T> = std::result::Result<T, SpiralError>;

/// Main error type for the orchestrator
///
/// Every component returns this type; no module invents its own error enum.
#[derive(Error, Debug)]
pub enum SpiralError {
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("task {0} is terminal and cannot be mutated")]
    TerminalImmutable(String),

    #[error("workflow is cyclic: {0}")]
    WorkflowCyclic(String),

    #[error("workflow {0} is stuck: no dispatchable task while tasks remain non-terminal")]
    WorkflowStuck(String),

    #[error("session expired")]
    SessionExpired,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("role definition error: {0}")]
    RoleDefinition(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
