//! System-wide constants shared across modules.

/// Default polling cadence for the remote transport adapter.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default per-request timeout for the remote transport adapter's HTTP client.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Session lifetime granted by `create_session`.
pub const DEFAULT_SESSION_DURATION_HOURS: i64 = 24;

/// Circuit breaker defaults for outbound remote-transport calls.
pub const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const CIRCUIT_BREAKER_SUCCESS_THRESHOLD: u32 = 3;
pub const CIRCUIT_BREAKER_TIMEOUT_SECS: u64 = 60;
