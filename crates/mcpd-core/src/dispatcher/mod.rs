//! Task dispatch and lifecycle tracking.
//!
//! Turns an external "run this instruction on service X" request into a
//! protocol call, tracks the resulting task through its states, and
//! publishes progress/completion events. Task records are mutated only
//! here; the HTTP layer goes through these methods.

pub mod instruction;

pub use instruction::{ToolCall, interpret};

use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, ProgressUpdate};
use crate::db::{LogLevel, NewTask, Store, TaskPatch, TaskStatus};
use crate::error::{Error, Result};
use crate::protocol::PendingCall;
use crate::supervisor::ServiceSupervisor;
use crate::types::TaskStats;

/// Dispatches instructions as trackable asynchronous tasks.
pub struct TaskDispatcher {
    store: Arc<dyn Store>,
    broadcaster: Arc<Broadcaster>,
    supervisor: Arc<ServiceSupervisor>,
    call_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        broadcaster: Arc<Broadcaster>,
        supervisor: Arc<ServiceSupervisor>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broadcaster,
            supervisor,
            call_timeout,
        })
    }

    /// Run an instruction against a running service.
    ///
    /// Returns the task id immediately; the result arrives asynchronously
    /// and is recorded by a spawned finalizer. Fails with `ServiceNotRunning`
    /// before creating any task record if no running worker exists.
    pub async fn execute_task(
        self: &Arc<Self>,
        service_id: &str,
        instruction: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<String> {
        let session = self.supervisor.running_session(service_id).await?;

        let task_id = uuid::Uuid::new_v4().to_string();
        self.store.create_task(&NewTask {
            id: task_id.clone(),
            service_id: service_id.to_string(),
            instruction: instruction.to_string(),
            context,
        })?;
        self.append_log(&task_id, LogLevel::Info, "Task created");
        info!(task_id = %task_id, service_id = %service_id, instruction = %instruction, "Task created");

        let call = match instruction::interpret(instruction) {
            Ok(call) => call,
            Err(e) => {
                self.finish_failed(&task_id, &e.to_string());
                return Err(e);
            }
        };

        let pending = match session
            .call_with_id(
                &task_id,
                "tools/call",
                Some(json!({
                    "name": call.tool,
                    "arguments": call.arguments,
                })),
            )
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.finish_failed(&task_id, &e.to_string());
                return Err(e);
            }
        };

        self.store.update_task(
            &task_id,
            &TaskPatch {
                status: Some(TaskStatus::Running),
                ..Default::default()
            },
        )?;
        self.broadcaster
            .publish_task_progress(ProgressUpdate {
                task_id: task_id.clone(),
                progress: 10,
                current_step: "Instruction dispatched to worker".to_string(),
                total_steps: 100,
                completed_steps: 10,
                logs: vec!["Task created and dispatched to worker".to_string()],
            })
            .await;

        let dispatcher = Arc::clone(self);
        let finalizer_task_id = task_id.clone();
        tokio::spawn(async move {
            dispatcher.finalize(finalizer_task_id, session, pending).await;
        });

        Ok(task_id)
    }

    /// Wait for the worker reply (bounded by the call timeout) and persist
    /// the task's terminal state.
    async fn finalize(
        self: Arc<Self>,
        task_id: String,
        session: Arc<crate::protocol::ProtocolSession>,
        pending: PendingCall,
    ) {
        let outcome = tokio::time::timeout(self.call_timeout, pending.wait()).await;

        // A task finished by other means (e.g. cancelled) keeps its terminal
        // record; the late worker outcome is dropped, never applied backward.
        match self.store.get_task(&task_id) {
            Ok(Some(task)) if !task.status.is_terminal() => {}
            Ok(_) => {
                debug!(task_id = %task_id, "Dropping worker outcome for finished task");
                session.forget(&task_id);
                return;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to load task for finalization");
                return;
            }
        }

        match outcome {
            Ok(Ok(result)) => {
                let patch = TaskPatch {
                    status: Some(TaskStatus::Completed),
                    progress: Some(100),
                    result: Some(result.clone()),
                    completed_at: Some(chrono::Utc::now().timestamp_millis()),
                    ..Default::default()
                };
                if let Err(e) = self.store.update_task(&task_id, &patch) {
                    warn!(task_id = %task_id, error = %e, "Failed to persist task completion");
                }
                self.append_log(&task_id, LogLevel::Info, "Task completed");
                info!(task_id = %task_id, "Task completed");
                self.broadcaster.publish_task_completed(&task_id, result).await;
            }
            Ok(Err(e)) => {
                self.finish_failed(&task_id, &e.to_string());
                warn!(task_id = %task_id, error = %e, "Task failed");
            }
            Err(_) => {
                // Required hardening: a silent worker can never leave a task
                // stuck in running.
                session.forget(&task_id);
                let e = Error::TaskTimeout {
                    id: task_id.clone(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                };
                self.finish_failed(&task_id, &e.to_string());
                warn!(task_id = %task_id, "Task timed out waiting for worker reply");
            }
        }
    }

    /// Cancel a pending or running task.
    ///
    /// Bookkeeping only: an already-dispatched tool call is not interrupted
    /// at the worker; its late reply is dropped by the task's terminal state.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Err(Error::TaskNotCancellable {
                id: task_id.to_string(),
                status: task.status.as_str().to_string(),
            });
        }

        self.finish_failed(task_id, "Task cancelled by user");
        info!(task_id = %task_id, "Task cancelled");
        Ok(())
    }

    /// Retry a failed task by creating a brand-new task with the same
    /// service, instruction, and context. The original record is untouched.
    pub async fn retry(self: &Arc<Self>, task_id: &str) -> Result<String> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        if task.status != TaskStatus::Failed {
            return Err(Error::TaskNotRetryable {
                id: task_id.to_string(),
                status: task.status.as_str().to_string(),
            });
        }

        info!(task_id = %task_id, "Retrying task");
        self.execute_task(&task.service_id, &task.instruction, task.context)
            .await
    }

    /// Aggregate statistics over recorded task history
    pub fn stats(&self) -> Result<TaskStats> {
        let tasks = self.store.list_tasks(1000, 0)?;
        let mut stats = TaskStats {
            total: tasks.len(),
            ..Default::default()
        };

        let mut completion_total_ms: i64 = 0;
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if let Some(completed_at) = task.completed_at {
                        completion_total_ms += completed_at - task.created_at;
                    }
                }
                TaskStatus::Failed => stats.failed += 1,
            }
        }

        if stats.completed > 0 {
            stats.average_completion_ms = completion_total_ms / stats.completed as i64;
        }
        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.success_rate = (stats.completed * 100 / finished) as u32;
        }
        Ok(stats)
    }

    fn finish_failed(&self, task_id: &str, message: &str) {
        let patch = TaskPatch {
            status: Some(TaskStatus::Failed),
            error_message: Some(message.to_string()),
            completed_at: Some(chrono::Utc::now().timestamp_millis()),
            ..Default::default()
        };
        if let Err(e) = self.store.update_task(task_id, &patch) {
            warn!(task_id = %task_id, error = %e, "Failed to persist task failure");
        }
        self.append_log(task_id, LogLevel::Error, message);
    }

    fn append_log(&self, task_id: &str, level: LogLevel, message: &str) {
        if let Err(e) = self.store.append_task_log(task_id, level, message) {
            warn!(task_id = %task_id, error = %e, "Failed to append task log");
        }
    }
}
