//! Error types for mcpd-core.

use thiserror::Error;

/// Result type alias using mcpd-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for mcpd operations
#[derive(Error, Debug)]
pub enum Error {
    // Service lifecycle errors
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service already running: {0}")]
    ServiceAlreadyRunning(String),

    #[error("Service not running: {0}")]
    ServiceNotRunning(String),

    #[error("Failed to spawn worker for service {service_id}: {reason}")]
    Spawn { service_id: String, reason: String },

    // Protocol errors
    #[error("Worker session closed")]
    SessionClosed,

    #[error("Malformed protocol line: {0}")]
    ProtocolParse(String),

    #[error("No reply to '{method}' within {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    #[error("Worker error {code}: {message}")]
    Worker { code: i64, message: String },

    // Task errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Could not parse instruction: {0}")]
    InstructionParse(String),

    #[error("Task {id} cannot be cancelled from status '{status}'")]
    TaskNotCancellable { id: String, status: String },

    #[error("Task {id} cannot be retried from status '{status}'")]
    TaskNotRetryable { id: String, status: String },

    #[error("Task {id} timed out after {timeout_ms}ms waiting for a worker reply")]
    TaskTimeout { id: String, timeout_ms: u64 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a spawn error for a service
    pub fn spawn(service_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            service_id: service_id.into(),
            reason: reason.into(),
        }
    }
}
