//! Service management routes.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::Json;
use mcpd_core::db::{NewService, ServiceDescriptor};
use mcpd_core::types::ServiceRuntimeStatus;
use serde::Serialize;
use std::sync::Arc;

use super::{ApiError, ApiResponse, ApiResult};
use crate::state::AppState;

/// Create services router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_services).post(install_service))
        .route("/{id}", delete(remove_service))
        .route("/{id}/status", get(get_service_status))
        .route("/{id}/start", post(start_service))
        .route("/{id}/stop", post(stop_service))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub service_id: String,
}

/// Register a new service
pub async fn install_service(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewService>,
) -> Result<(StatusCode, Json<ApiResponse<InstallResponse>>), ApiError> {
    let service_id = state.supervisor.install(&request).await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::ok(InstallResponse { service_id }),
    ))
}

/// List all registered services
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<ServiceDescriptor>> {
    let services = state.supervisor.list_services()?;
    Ok(ApiResponse::ok(services))
}

/// Combined persisted + live status for one service
pub async fn get_service_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ServiceRuntimeStatus> {
    let status = state.supervisor.status(&id).await?;
    Ok(ApiResponse::ok(status))
}

/// Start a service's worker
pub async fn start_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.supervisor.start(&id).await?;
    Ok(ApiResponse::message("Service started successfully"))
}

/// Request a service's worker to stop
pub async fn stop_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.supervisor.stop(&id).await?;
    Ok(ApiResponse::message("Service stop requested"))
}

/// Stop (if running) and delete a service
pub async fn remove_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.supervisor.remove(&id).await?;
    Ok(ApiResponse::message("Service removed successfully"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mcpd_core::Database;
    use mcpd_core::db::{CapabilitySummary, LaunchSpec};

    fn test_state() -> Arc<AppState> {
        let db = Database::open_in_memory().unwrap();
        AppState::new(Config::default(), db)
    }

    fn sample_request() -> NewService {
        NewService {
            name: "calculator".to_string(),
            description: "demo".to_string(),
            version: "1.0.0".to_string(),
            capabilities: CapabilitySummary::default(),
            launch: LaunchSpec {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 0".to_string()],
                working_directory: None,
                environment: Default::default(),
            },
        }
    }

    #[tokio::test]
    async fn test_install_and_list() {
        let state = test_state();

        let (status, response) =
            install_service(State(Arc::clone(&state)), Json(sample_request()))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let service_id = response.0.data.unwrap().service_id;

        let listed = list_services(State(Arc::clone(&state))).await.unwrap();
        let services = listed.0.data.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, service_id);
        assert_eq!(services[0].name, "calculator");
    }

    #[tokio::test]
    async fn test_status_of_installed_service() {
        let state = test_state();
        let (_, response) = install_service(State(Arc::clone(&state)), Json(sample_request()))
            .await
            .unwrap();
        let service_id = response.0.data.unwrap().service_id;

        let status = get_service_status(State(Arc::clone(&state)), Path(service_id))
            .await
            .unwrap();
        let status = status.0.data.unwrap();
        assert!(!status.is_running);
        assert!(status.run_state.is_none());
    }

    #[tokio::test]
    async fn test_status_of_unknown_service_is_404() {
        use axum::response::IntoResponse;

        let state = test_state();
        let err = get_service_status(State(state), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_install_request_deserializes_wire_shape() {
        // The launch spec is flattened into the request body
        let request: NewService = serde_json::from_str(
            r#"{
                "name": "calculator",
                "description": "demo",
                "version": "1.0.0",
                "command": "node",
                "args": ["calculator-service.js"],
                "workingDirectory": "/srv/workers",
                "environment": {"DEBUG": "1"},
                "capabilities": {"tools": ["add"], "resources": []}
            }"#,
        )
        .unwrap();
        assert_eq!(request.launch.command, "node");
        assert_eq!(
            request.launch.working_directory.as_deref(),
            Some("/srv/workers")
        );
        assert_eq!(request.capabilities.tools, vec!["add"]);
    }
}
