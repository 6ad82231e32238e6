//! Task routes.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use mcpd_core::db::{Task, TaskLogEntry, TaskStatus};
use mcpd_core::types::TaskStats;
use mcpd_core::Store;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::{ApiError, ApiResponse, ApiResult};
use crate::state::AppState;

/// Create tasks router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tasks).post(execute_task))
        .route("/stats/summary", get(task_stats))
        .route("/{id}", get(get_task))
        .route("/{id}/logs", get(get_task_logs))
        .route("/{id}/cancel", post(cancel_task))
        .route("/{id}/retry", post(retry_task))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTaskRequest {
    pub service_id: String,
    pub instruction: String,
    pub context: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTaskResponse {
    pub task_id: String,
    pub status: String,
}

/// Execute an instruction as a new task
pub async fn execute_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteTaskRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ExecuteTaskResponse>>), ApiError> {
    let task_id = state
        .dispatcher
        .execute_task(&request.service_id, &request.instruction, request.context)
        .await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::ok(ExecuteTaskResponse {
            task_id,
            status: "running".to_string(),
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub status: Option<TaskStatus>,
    pub service_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    pub total: usize,
    pub limit: u32,
    pub offset: u32,
}

/// List recorded tasks, newest first
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<TaskListResponse> {
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);

    let mut tasks = state.db.list_tasks(limit, offset)?;
    if let Some(status) = query.status {
        tasks.retain(|t| t.status == status);
    }
    if let Some(service_id) = &query.service_id {
        tasks.retain(|t| &t.service_id == service_id);
    }

    let total = tasks.len();
    Ok(ApiResponse::ok(TaskListResponse {
        tasks,
        total,
        limit,
        offset,
    }))
}

/// Get one task by id
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Task> {
    let task = state
        .db
        .get_task(&id)?
        .ok_or_else(|| mcpd_core::Error::TaskNotFound(id))?;
    Ok(ApiResponse::ok(task))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogsResponse {
    pub task_id: String,
    pub logs: Vec<TaskLogEntry>,
}

/// Get a task's diagnostic log trail
pub async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TaskLogsResponse> {
    state
        .db
        .get_task(&id)?
        .ok_or_else(|| mcpd_core::Error::TaskNotFound(id.clone()))?;
    let logs = state.db.get_task_logs(&id)?;
    Ok(ApiResponse::ok(TaskLogsResponse { task_id: id, logs }))
}

/// Cancel a pending or running task (bookkeeping only)
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.dispatcher.cancel(&id).await?;
    Ok(ApiResponse::message("Task cancelled successfully"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub original_task_id: String,
    pub new_task_id: String,
}

/// Retry a failed task as a brand-new task
pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<RetryResponse> {
    let new_task_id = state.dispatcher.retry(&id).await?;
    Ok(ApiResponse::ok(RetryResponse {
        original_task_id: id,
        new_task_id,
    }))
}

/// Aggregate task statistics
pub async fn task_stats(State(state): State<Arc<AppState>>) -> ApiResult<TaskStats> {
    let stats = state.dispatcher.stats()?;
    Ok(ApiResponse::ok(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::response::IntoResponse;
    use mcpd_core::db::{CapabilitySummary, LaunchSpec, NewService, NewTask, TaskPatch};
    use mcpd_core::Database;

    fn test_state() -> Arc<AppState> {
        let db = Database::open_in_memory().unwrap();
        AppState::new(Config::default(), db)
    }

    fn seed_service(state: &AppState, id: &str) {
        state
            .db
            .create_service(
                id,
                &NewService {
                    name: id.to_string(),
                    description: String::new(),
                    version: "1.0.0".to_string(),
                    capabilities: CapabilitySummary::default(),
                    launch: LaunchSpec {
                        command: "node".to_string(),
                        args: vec![],
                        working_directory: None,
                        environment: Default::default(),
                    },
                },
            )
            .unwrap();
    }

    fn seed_task(state: &AppState, id: &str, service_id: &str) {
        seed_service(state, service_id);
        state
            .db
            .create_task(&NewTask {
                id: id.to_string(),
                service_id: service_id.to_string(),
                instruction: "add 1 and 2".to_string(),
                context: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_unknown_task_is_404() {
        let state = test_state();
        let err = get_task(State(state), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_execute_on_unknown_service_is_400() {
        let state = test_state();
        let err = execute_task(
            State(state),
            Json(ExecuteTaskRequest {
                service_id: "nope".to_string(),
                instruction: "add 1 and 2".to_string(),
                context: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_tasks_filters() {
        let state = test_state();
        seed_task(&state, "task-1", "svc-a");
        seed_task(&state, "task-2", "svc-b");
        state
            .db
            .update_task(
                "task-2",
                &TaskPatch {
                    status: Some(TaskStatus::Failed),
                    error_message: Some("boom".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let all = list_tasks(State(Arc::clone(&state)), Query(ListTasksQuery::default()))
            .await
            .unwrap();
        assert_eq!(all.0.data.unwrap().total, 2);

        let failed = list_tasks(
            State(Arc::clone(&state)),
            Query(ListTasksQuery {
                status: Some(TaskStatus::Failed),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        let failed = failed.0.data.unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.tasks[0].id, "task-2");

        let by_service = list_tasks(
            State(state),
            Query(ListTasksQuery {
                service_id: Some("svc-a".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(by_service.0.data.unwrap().tasks[0].id, "task-1");
    }

    #[tokio::test]
    async fn test_task_logs_for_unknown_task_is_404() {
        let state = test_state();
        let err = get_task_logs(State(state), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_completed_task_is_400() {
        let state = test_state();
        seed_task(&state, "task-1", "svc-a");
        state
            .db
            .update_task(
                "task-1",
                &TaskPatch {
                    status: Some(TaskStatus::Completed),
                    progress: Some(100),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = cancel_task(State(state), Path("task-1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_endpoint_shape() {
        let state = test_state();
        seed_task(&state, "task-1", "svc-a");

        let stats = task_stats(State(state)).await.unwrap();
        let stats = stats.0.data.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 1);
    }
}
