//! Periodic liveness checking for running workers.
//!
//! Each tick walks the workers currently in `running` state. A worker whose
//! process already exited is demoted immediately, without a ping; everything
//! else gets a liveness ping through its protocol session, and a successful
//! send updates the last-heartbeat timestamp. The tick never blocks on a
//! reply - a silent worker is caught by exit detection, not by the ping.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use super::ServiceSupervisor;

/// Interval-driven health checker over the supervisor's worker registry.
pub struct HealthMonitor {
    supervisor: Arc<ServiceSupervisor>,
    period: Duration,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<ServiceSupervisor>, period: Duration) -> Self {
        Self { supervisor, period }
    }

    /// Spawn the check loop; abort the returned handle to stop it.
    pub fn start(self) -> AbortHandle {
        let handle = tokio::spawn(async move {
            let mut tick = interval(self.period);
            loop {
                tick.tick().await;
                self.check_all().await;
            }
        });
        handle.abort_handle()
    }

    /// One health-check pass. A single worker's failure never affects the
    /// other workers in the same tick.
    pub async fn check_all(&self) {
        for worker in self.supervisor.running_workers().await {
            if worker.exited.load(Ordering::SeqCst) {
                debug!(service_id = %worker.service_id, "Health check found exited worker");
                self.supervisor
                    .handle_exit(&worker.service_id, worker.pid)
                    .await;
                continue;
            }

            match worker.session.ping().await {
                Ok(()) => {
                    self.supervisor.touch_heartbeat(&worker.service_id).await;
                }
                Err(e) => {
                    warn!(
                        service_id = %worker.service_id,
                        error = %e,
                        "Health ping failed"
                    );
                }
            }
        }
    }
}
