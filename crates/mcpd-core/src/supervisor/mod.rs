//! Worker process supervision.
//!
//! The [`ServiceSupervisor`] owns the worker registry (service id →
//! [`WorkerHandle`]); every mutation goes through its methods, so the
//! registry has a single writer. Other components read through accessors.
//!
//! State machine per service:
//! `inactive → starting → running → stopping → {stopped | error}`, with
//! `error` reachable directly from `starting`/`running` on spawn failure or
//! a failed handshake. Every transition persists the descriptor status and
//! publishes a `service_status` event.

mod health;

pub use health::HealthMonitor;

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::broadcast::{Broadcaster, ServiceEvent};
use crate::db::{NewService, ServiceDescriptor, ServiceStatus, Store};
use crate::error::{Error, Result};
use crate::protocol::ProtocolSession;
use crate::types::{OrchestratorConfig, ServiceRuntimeStatus};

/// Run-state of a live worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// In-memory handle for one live worker process. Exists only while the
/// process is live; never persisted.
struct WorkerHandle {
    pid: Option<u32>,
    state: RunState,
    last_heartbeat: i64,
    capabilities: Option<Value>,
    session: Arc<ProtocolSession>,
    exited: Arc<AtomicBool>,
}

/// Read-only view of a running worker, handed to the health monitor
pub struct WorkerSnapshot {
    pub service_id: String,
    pub pid: Option<u32>,
    pub session: Arc<ProtocolSession>,
    pub exited: Arc<AtomicBool>,
}

/// Spawns, supervises, and terminates worker processes.
pub struct ServiceSupervisor {
    store: Arc<dyn Store>,
    broadcaster: Arc<Broadcaster>,
    config: OrchestratorConfig,
    workers: RwLock<HashMap<String, WorkerHandle>>,
}

impl ServiceSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        broadcaster: Arc<Broadcaster>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broadcaster,
            config,
            workers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new service descriptor without starting it
    pub async fn install(&self, service: &NewService) -> Result<String> {
        let service_id = uuid::Uuid::new_v4().to_string();
        self.store.create_service(&service_id, service)?;
        info!(
            service_id = %service_id,
            name = %service.name,
            version = %service.version,
            "Service installed"
        );
        self.broadcaster
            .publish_service_status(&service_id, ServiceEvent::Installed)
            .await;
        Ok(service_id)
    }

    /// Spawn the worker for a service and perform the initialize handshake.
    ///
    /// On success the worker is `running` and the descriptor is `active`.
    /// A spawn or handshake failure persists `error`; an exit observed while
    /// starting leaves the exit path's `inactive`.
    pub async fn start(self: &Arc<Self>, service_id: &str) -> Result<()> {
        let descriptor = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;

        let launch = &descriptor.launch;
        info!(
            service_id = %service_id,
            name = %descriptor.name,
            command = %launch.command,
            "Starting service"
        );

        // Reserve the registry slot before spawning so a concurrent start
        // observes ServiceAlreadyRunning, and keep the lock until the handle
        // is inserted.
        let mut workers = self.workers.write().await;
        if workers.contains_key(service_id) {
            return Err(Error::ServiceAlreadyRunning(service_id.to_string()));
        }

        if !launch.command.contains('/') && which::which(&launch.command).is_err() {
            drop(workers);
            return Err(self
                .fail_start(service_id, format!("command not found: {}", launch.command))
                .await);
        }

        let cwd = launch
            .working_directory
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.services_dir.clone());

        let mut command = Command::new(&launch.command);
        command
            .args(&launch.args)
            .envs(&launch.environment)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(workers);
                return Err(self.fail_start(service_id, e.to_string()).await);
            }
        };

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            drop(workers);
            let _ = child.start_kill();
            return Err(self
                .fail_start(service_id, "failed to capture worker stdio".to_string())
                .await);
        };
        let stderr = child.stderr.take();

        let session = ProtocolSession::new(service_id, stdin, stdout);
        let exited = Arc::new(AtomicBool::new(false));
        workers.insert(
            service_id.to_string(),
            WorkerHandle {
                pid,
                state: RunState::Starting,
                last_heartbeat: chrono::Utc::now().timestamp_millis(),
                capabilities: None,
                session: Arc::clone(&session),
                exited: Arc::clone(&exited),
            },
        );
        drop(workers);

        // Drain worker stderr into the log
        if let Some(stderr) = stderr {
            let sid = service_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(service_id = %sid, message = %line.trim(), "Worker stderr");
                }
            });
        }

        // Exit watcher: observes the process ending, whether expected or not
        {
            let supervisor = Arc::clone(self);
            let sid = service_id.to_string();
            let exited = Arc::clone(&exited);
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        info!(service_id = %sid, code = status.code().unwrap_or(-1), "Worker process exited")
                    }
                    Err(e) => warn!(service_id = %sid, error = %e, "Failed to wait on worker"),
                }
                exited.store(true, Ordering::SeqCst);
                supervisor.handle_exit(&sid, pid).await;
            });
        }

        match session.initialize(self.config.handshake_timeout).await {
            Ok(reply) => {
                let capabilities = reply.get("capabilities").cloned();
                let mut workers = self.workers.write().await;
                match workers.get_mut(service_id) {
                    Some(handle) if handle.pid == pid => {
                        handle.state = RunState::Running;
                        handle.capabilities = capabilities;
                        handle.last_heartbeat = chrono::Utc::now().timestamp_millis();
                    }
                    // The worker died during the handshake; the exit watcher
                    // already demoted it.
                    _ => {
                        return Err(Error::spawn(service_id, "worker exited during startup"));
                    }
                }
                drop(workers);

                self.store
                    .update_service_status(service_id, ServiceStatus::Active)?;
                self.broadcaster
                    .publish_service_status(service_id, ServiceEvent::Running)
                    .await;
                info!(service_id = %service_id, name = %descriptor.name, "Service started");
                Ok(())
            }
            Err(e) => {
                let removed = {
                    let mut workers = self.workers.write().await;
                    match workers.get(service_id) {
                        Some(handle) if handle.pid == pid => {
                            workers.remove(service_id);
                            true
                        }
                        _ => false,
                    }
                };
                if removed {
                    if let Some(pid) = pid {
                        signal(pid, libc::SIGKILL);
                    }
                    if let Err(store_err) = self
                        .store
                        .update_service_status(service_id, ServiceStatus::Error)
                    {
                        warn!(service_id = %service_id, error = %store_err, "Failed to persist error status");
                    }
                    self.broadcaster
                        .publish_service_status(service_id, ServiceEvent::Error)
                        .await;
                }
                Err(Error::spawn(
                    service_id,
                    format!("initialize handshake failed: {e}"),
                ))
            }
        }
    }

    /// Request graceful termination; force-kill after the grace window.
    ///
    /// The scheduled force-kill is a no-op if the worker already exited (the
    /// handle is gone, or it belongs to a newer incarnation).
    pub async fn stop(self: &Arc<Self>, service_id: &str) -> Result<()> {
        let pid = {
            let mut workers = self.workers.write().await;
            let handle = workers
                .get_mut(service_id)
                .ok_or_else(|| Error::ServiceNotRunning(service_id.to_string()))?;
            handle.state = RunState::Stopping;
            handle.pid
        };

        info!(service_id = %service_id, "Stopping service");
        if let Some(pid) = pid {
            signal(pid, libc::SIGTERM);
        }

        let supervisor = Arc::clone(self);
        let sid = service_id.to_string();
        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = {
                let workers = supervisor.workers.read().await;
                matches!(workers.get(&sid), Some(handle) if handle.pid == pid)
            };
            if still_running {
                if let Some(pid) = pid {
                    warn!(service_id = %sid, "Grace window elapsed; force-killing worker");
                    signal(pid, libc::SIGKILL);
                }
            }
        });

        Ok(())
    }

    /// Stop the worker if running, then delete the service descriptor.
    /// Emits a `removed` event regardless of whether a worker was running.
    pub async fn remove(self: &Arc<Self>, service_id: &str) -> Result<()> {
        match self.stop(service_id).await {
            Ok(()) | Err(Error::ServiceNotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        self.store.delete_service(service_id)?;
        info!(service_id = %service_id, "Service removed");
        self.broadcaster
            .publish_service_status(service_id, ServiceEvent::Removed)
            .await;
        Ok(())
    }

    /// Combined persisted + live status for one service
    pub async fn status(&self, service_id: &str) -> Result<ServiceRuntimeStatus> {
        let descriptor = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;

        let workers = self.workers.read().await;
        let handle = workers.get(service_id);
        Ok(ServiceRuntimeStatus {
            id: descriptor.id,
            status: descriptor.status,
            is_running: matches!(handle, Some(h) if h.state == RunState::Running),
            run_state: handle.map(|h| h.state),
            last_heartbeat: handle.map(|h| h.last_heartbeat),
            capabilities: handle.and_then(|h| h.capabilities.clone()),
        })
    }

    /// All registered service descriptors
    pub fn list_services(&self) -> Result<Vec<ServiceDescriptor>> {
        self.store.list_services()
    }

    /// Session of a worker in `running` state
    pub async fn running_session(&self, service_id: &str) -> Result<Arc<ProtocolSession>> {
        let workers = self.workers.read().await;
        match workers.get(service_id) {
            Some(handle) if handle.state == RunState::Running => Ok(Arc::clone(&handle.session)),
            _ => Err(Error::ServiceNotRunning(service_id.to_string())),
        }
    }

    /// Snapshot of every worker currently in `running` state
    pub async fn running_workers(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .filter(|(_, handle)| handle.state == RunState::Running)
            .map(|(id, handle)| WorkerSnapshot {
                service_id: id.clone(),
                pid: handle.pid,
                session: Arc::clone(&handle.session),
                exited: Arc::clone(&handle.exited),
            })
            .collect()
    }

    /// Number of live worker handles
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Record a successful liveness send for a worker
    pub async fn touch_heartbeat(&self, service_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(handle) = workers.get_mut(service_id) {
            handle.last_heartbeat = chrono::Utc::now().timestamp_millis();
        }
    }

    /// Stop every running worker (used on shutdown)
    pub async fn stop_all(self: &Arc<Self>) {
        let ids: Vec<String> = {
            let workers = self.workers.read().await;
            workers.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(service_id = %id, error = %e, "Error stopping service during shutdown");
            }
        }
    }

    /// Record a failed start: persist `error`, publish the transition, and
    /// build the spawn error for the caller.
    async fn fail_start(&self, service_id: &str, reason: String) -> Error {
        if let Err(e) = self
            .store
            .update_service_status(service_id, ServiceStatus::Error)
        {
            warn!(service_id = %service_id, error = %e, "Failed to persist error status");
        }
        self.broadcaster
            .publish_service_status(service_id, ServiceEvent::Error)
            .await;
        warn!(service_id = %service_id, reason = %reason, "Failed to start service");
        Error::spawn(service_id, reason)
    }

    /// Demote a worker whose process is gone. Removes the handle, persists
    /// `inactive`, and publishes `stopped`. Idempotent: the handle is removed
    /// exactly once, whichever observer gets here first.
    pub(crate) async fn handle_exit(&self, service_id: &str, pid: Option<u32>) {
        let was_stopping = {
            let mut workers = self.workers.write().await;
            match workers.get(service_id) {
                Some(handle) if handle.pid == pid => {
                    let stopping = handle.state == RunState::Stopping;
                    workers.remove(service_id);
                    stopping
                }
                _ => return,
            }
        };

        if let Err(e) = self
            .store
            .update_service_status(service_id, ServiceStatus::Inactive)
        {
            warn!(service_id = %service_id, error = %e, "Failed to persist inactive status");
        }
        self.broadcaster
            .publish_service_status(service_id, ServiceEvent::Stopped)
            .await;

        if was_stopping {
            info!(service_id = %service_id, "Worker stopped");
        } else {
            warn!(service_id = %service_id, "Worker exited unexpectedly");
        }
    }

    #[cfg(test)]
    pub(crate) async fn run_state(&self, service_id: &str) -> Option<RunState> {
        self.workers.read().await.get(service_id).map(|h| h.state)
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    // Best effort; an already-reaped pid is fine to miss.
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}
