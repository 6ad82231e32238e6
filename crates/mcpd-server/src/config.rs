//! Server configuration.

use mcpd_core::OrchestratorConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base data directory
    pub data_dir: PathBuf,
    /// HTTP listen address
    pub http_addr: String,
    /// Database path
    pub database_path: PathBuf,
    /// Default working directory for workers
    pub services_dir: PathBuf,
    /// Interval between health-check ticks, in milliseconds
    pub health_check_interval_ms: u64,
    /// Timeout for a dispatched tool call, in milliseconds
    pub call_timeout_ms: u64,
    /// Grace window between SIGTERM and SIGKILL, in milliseconds
    pub stop_grace_ms: u64,
    /// Timeout for the initialize handshake, in milliseconds
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = home.join(".mcpd");

        Self {
            http_addr: "127.0.0.1:3001".to_string(),
            database_path: data_dir.join("sqlite.db"),
            services_dir: data_dir.join("services"),
            data_dir,
            health_check_interval_ms: 60_000,
            call_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from environment overrides and defaults
    ///
    /// Standard directory structure:
    /// ```text
    /// ~/.mcpd/
    /// ├── sqlite.db             # Database
    /// └── services/             # Default worker working directory
    /// ```
    pub fn load() -> anyhow::Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        // Use MCPD_DIR env var if set, otherwise ~/.mcpd
        let data_dir = std::env::var("MCPD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".mcpd"));

        let database_path = std::env::var("MCPD_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("sqlite.db"));
        let services_dir = std::env::var("MCPD_SERVICES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("services"));

        // Create directories if they don't exist
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&services_dir)?;

        Ok(Self {
            http_addr: std::env::var("MCPD_HTTP_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:3001".to_string()),
            database_path,
            services_dir,
            data_dir,
            health_check_interval_ms: env_u64("MCPD_HEALTH_CHECK_INTERVAL_MS", 60_000),
            call_timeout_ms: env_u64("MCPD_CALL_TIMEOUT_MS", 30_000),
            stop_grace_ms: env_u64("MCPD_STOP_GRACE_MS", 5_000),
            handshake_timeout_ms: env_u64("MCPD_HANDSHAKE_TIMEOUT_MS", 10_000),
        })
    }

    /// Tunables handed to the orchestrator components
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            services_dir: self.services_dir.clone(),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
