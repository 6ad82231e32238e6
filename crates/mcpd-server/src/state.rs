//! Application state.

use mcpd_core::{Broadcaster, Database, ServiceSupervisor, Store, TaskDispatcher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;

/// Shared application state
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Event broadcaster for subscriber connections
    pub broadcaster: Arc<Broadcaster>,
    /// Worker process supervisor
    pub supervisor: Arc<ServiceSupervisor>,
    /// Task dispatcher
    pub dispatcher: Arc<TaskDispatcher>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state, wiring the orchestrator components
    /// with their injected store and broadcaster.
    pub fn new(config: Config, db: Database) -> Arc<Self> {
        let db = Arc::new(db);
        let store: Arc<dyn Store> = Arc::clone(&db) as Arc<dyn Store>;

        let broadcaster = Broadcaster::new(Arc::clone(&store));
        let supervisor = ServiceSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            config.orchestrator(),
        );
        let dispatcher = TaskDispatcher::new(
            store,
            Arc::clone(&broadcaster),
            Arc::clone(&supervisor),
            Duration::from_millis(config.call_timeout_ms),
        );

        Arc::new(Self {
            config: Arc::new(config),
            db,
            broadcaster,
            supervisor,
            dispatcher,
            start_time: Instant::now(),
        })
    }
}
