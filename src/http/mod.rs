pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::engine::Engine;
use crate::error::Error;
use crate::store::users::UserStore;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub users: Arc<UserStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/projects", get(handlers::list_projects))
        .route("/api/projects/import", post(handlers::import_project))
        .route(
            "/api/projects/{id}",
            get(handlers::get_project).patch(handlers::update_project),
        )
        .route("/api/projects/{id}/deploy", post(handlers::deploy))
        .route("/api/projects/{id}/deployments", get(handlers::list_deployments))
        .route("/api/projects/{id}/rollback", post(handlers::rollback))
        .route("/api/deployments/{id}", get(handlers::get_deployment))
        .route("/api/deployments/{id}/log", get(handlers::get_log))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_)
        | Error::ConfigIncomplete(_)
        | Error::PathEscape { .. }
        | Error::SecretDowngrade(_)
        | Error::SecretMissingValue(_)
        | Error::NoPrevious => StatusCode::BAD_REQUEST,
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::ProjectExists(_) => StatusCode::CONFLICT,
        Error::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        Error::SecretDecrypt(_)
        | Error::CommandFailed { .. }
        | Error::Io(_)
        | Error::Json(_)
        | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(error = %self.chain(), "request failed");
        }
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
