use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use execbox_core::ExecboxError;
use execbox_utils::UtilsError;
use thiserror::Error;

use crate::payload::ErrorResponse;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a server operation.
pub type ServerResult<T> = Result<T, ServerError>;

/// An error that occurred in the execbox server.
#[derive(pretty_error_debug::Debug, Error)]
pub enum ServerError {
    /// The server configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An error from the execution core.
    #[error(transparent)]
    Core(#[from] ExecboxError),

    /// An error reading the environment.
    #[error(transparent)]
    Utils(#[from] UtilsError),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Core(ExecboxError::UnsupportedRuntime(_))
            | ServerError::Core(ExecboxError::InvalidSessionId(_)) => StatusCode::BAD_REQUEST,
            ServerError::Core(ExecboxError::SessionAlreadyExists(_)) => StatusCode::CONFLICT,
            ServerError::Core(ExecboxError::SandboxUnavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!("request failed: {}", self);
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
