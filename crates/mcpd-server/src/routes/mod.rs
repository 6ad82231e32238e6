//! HTTP routes.
//!
//! Thin CRUD-style translation into core operations; no orchestration logic
//! lives here. Responses use a uniform `{success, data, error, message}`
//! envelope and typed core errors map onto status codes.

pub mod health;
pub mod services;
pub mod tasks;
pub mod ws;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use mcpd_core::Error;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

/// Assemble the full application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ws", get(ws::websocket))
        .nest("/api/services", services::router())
        .nest("/api/tasks", tasks::router())
        .with_state(state)
}

/// Uniform response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        })
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: None,
            error: None,
            message: Some(message.into()),
        })
    }
}

/// Core error carried out of a handler
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::ServiceNotFound(_) | Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Error::ServiceAlreadyRunning(_) => StatusCode::CONFLICT,
            Error::ServiceNotRunning(_)
            | Error::InstructionParse(_)
            | Error::TaskNotCancellable { .. }
            | Error::TaskNotRetryable { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
            message: None,
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_for(error: Error) -> StatusCode {
        ApiError(error).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(Error::ServiceNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(Error::TaskNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(Error::ServiceAlreadyRunning("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(Error::ServiceNotRunning("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(Error::InstructionParse("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(Error::TaskNotCancellable {
                id: "x".into(),
                status: "completed".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(Error::SessionClosed),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_envelope_shapes() {
        let ok = ApiResponse::ok(serde_json::json!({"x": 1}));
        let value = serde_json::to_value(&ok.0).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["x"], 1);
        assert!(value.get("error").is_none());

        let msg = ApiResponse::message("done");
        let value = serde_json::to_value(&msg.0).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["message"], "done");
    }
}
