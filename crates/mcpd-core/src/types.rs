//! Shared runtime types for mcpd-core.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::ServiceStatus;
use crate::supervisor::RunState;

/// Tunables for the orchestrator components.
///
/// Loaded by the server from configuration and passed into the supervisor
/// and dispatcher constructors.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between health-check ticks
    pub health_check_interval: Duration,
    /// How long a dispatched tool call may wait for a reply before the task fails
    pub call_timeout: Duration,
    /// Grace window between SIGTERM and SIGKILL when stopping a worker
    pub stop_grace: Duration,
    /// How long the initialize handshake may take before start fails
    pub handshake_timeout: Duration,
    /// Default working directory for workers without one configured
    pub services_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            services_dir: PathBuf::from("."),
        }
    }
}

/// Combined persisted + live view of one service, for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRuntimeStatus {
    pub id: String,
    /// Persisted descriptor status
    pub status: ServiceStatus,
    /// Whether a worker is live and past its handshake
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_state: Option<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
}

/// Aggregate task statistics derived from recorded task history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// Percentage of finished tasks that completed successfully
    pub success_rate: u32,
    /// Mean wall-clock duration of completed tasks, in milliseconds
    pub average_completion_ms: i64,
}
