//! # Spiral Orchestrator
//!
//! A distributed multi-agent task orchestrator: a lifecycle state machine for
//! tasks, a dependency-aware workflow engine that dispatches work to
//! subagents, pluggable local/remote transports, and an RBAC security layer
//! gating agent and skill access.
//!
//! ## Architecture
//!
//! - **Engine**: the task lifecycle state machine, event journal, and
//!   subscriber/stream fan-out.
//! - **Orchestrator**: workflow creation, dependency-graph dispatch, and
//!   cancellation.
//! - **Transport**: the `TransportAdapter` trait with local (in-process) and
//!   remote (HTTP-polling) implementations.
//! - **Security**: identity, device trust, sessions, RBAC policy, and audit
//!   logging.
//! - **Runtime**: the facade that fronts a transport adapter and reports
//!   status.

/// HTTP API server and endpoints
pub mod api;
/// Authentication middleware
pub mod auth;
/// Circuit breaker guarding outbound remote-transport calls
pub mod claude_code;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Task lifecycle state machine
pub mod engine;
/// Error types and handling
pub mod error;
/// Id generation and injectable clock
pub mod ids;
/// Core data models
pub mod models;
/// Workflow creation, dependency dispatch, and cancellation
pub mod orchestrator;
/// Rate limiting functionality
pub mod rate_limit;
/// Agent role registry and project context
pub mod roles;
/// The runtime facade fronting a transport adapter
pub mod runtime;
/// Identity, device trust, sessions, RBAC policy, and audit logging
pub mod security;
/// Task persistence
pub mod store;
/// Pluggable local/remote transport adapters
pub mod transport;
/// Input validation and sanitization
pub mod validation;

pub use error::{Result, SpiralError};
