//! mcpd-core - Core library for mcpd
//!
//! This crate contains the orchestration logic shared by the mcpd server:
//!
//! - **db**: SQLite persistence for services, tasks, logs, and connections
//! - **protocol**: line-delimited JSON-RPC sessions with worker processes
//! - **supervisor**: worker process lifecycle and health monitoring
//! - **dispatcher**: task dispatch and completion tracking
//! - **broadcast**: topic-based event fan-out to live subscribers

pub mod broadcast;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use broadcast::Broadcaster;
pub use db::{Database, Store};
pub use dispatcher::TaskDispatcher;
pub use error::{Error, Result};
pub use supervisor::{HealthMonitor, ServiceSupervisor};
pub use types::OrchestratorConfig;
