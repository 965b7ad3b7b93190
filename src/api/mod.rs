//! JSON-over-HTTP surfaces of the center and the agent.
//!
//! Every response uses the same envelope:
//! `{"success": true, "data": ..., "message": ...}` on success and
//! `{"success": false, "code": "...", "message": "..."}` on failure, where
//! `code` is [`BenchError::code`].

pub mod agent;
pub mod center;

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{BenchError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default = "none", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn none<T>() -> Option<T> {
    None
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            code: None,
            message: None,
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok(data)
        }
    }

    /// Turn a decoded remote envelope back into a typed result.
    pub fn into_result(self) -> Result<T> {
        if !self.success {
            let code = self.code.unwrap_or_else(|| "REMOTE_ERROR".to_string());
            return Err(BenchError::from_remote(&code, self.message.unwrap_or_default()));
        }
        self.data
            .ok_or_else(|| BenchError::Internal("response without data".to_string()))
    }
}

/// Request body for starting a run on an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRunRequest {
    pub test_case: String,
    pub port: String,
}

pub type ApiResult<T> = std::result::Result<Json<Envelope<T>>, ApiError>;

/// [`BenchError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub BenchError);

impl From<BenchError> for ApiError {
    fn from(err: BenchError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &BenchError) -> StatusCode {
    match err {
        BenchError::HostBusy { .. }
        | BenchError::HolderBusyElsewhere { .. }
        | BenchError::HostExists(_) => StatusCode::CONFLICT,
        BenchError::NoPermission { .. } | BenchError::HolderMismatch => StatusCode::FORBIDDEN,
        BenchError::LeaseNotFound
        | BenchError::SessionNotFound
        | BenchError::HostNotFound(_)
        | BenchError::CaseNotFound(_)
        | BenchError::RunNotFound(_) => StatusCode::NOT_FOUND,
        BenchError::InvalidAddress(_)
        | BenchError::InvalidRequest(_)
        | BenchError::RunFinished { .. } => StatusCode::BAD_REQUEST,
        BenchError::HostOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
        BenchError::Remote { .. } | BenchError::Http(_) => StatusCode::BAD_GATEWAY,
        BenchError::Spawn(_) | BenchError::Io(_) | BenchError::Json(_) | BenchError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "Request failed");
        }
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            code: Some(self.0.code().to_string()),
            message: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve `app` until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
