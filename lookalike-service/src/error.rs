use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lookalike_core::{ErrorEnvelope, LookalikeError};

pub struct AppError {
    pub status: StatusCode,
    pub body: ErrorEnvelope,
}

impl AppError {
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorEnvelope::internal(&msg.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}

impl From<LookalikeError> for AppError {
    fn from(err: LookalikeError) -> Self {
        let status = match &err {
            LookalikeError::DirectoryNotFound(_)
            | LookalikeError::UnknownDirectory(_)
            | LookalikeError::JobNotFound(_) => StatusCode::NOT_FOUND,
            LookalikeError::InvalidPrefixBits(_)
            | LookalikeError::InvalidCriteria(_)
            | LookalikeError::UnknownJobKind(_)
            | LookalikeError::InvalidJobParams(_)
            | LookalikeError::MissingDirectory(_) => StatusCode::BAD_REQUEST,
            LookalikeError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            body: ErrorEnvelope::from(&err),
        }
    }
}
