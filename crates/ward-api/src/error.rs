use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use ward_core::remote::RejectCode;
use ward_core::RemoteError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("{message}")]
    Rejected { code: RejectCode, message: String },
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }
}

impl From<RemoteError> for AppError {
    fn from(value: RemoteError) -> Self {
        match value {
            RemoteError::Rejected { code, message } => Self::Rejected { code, message },
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, None),
            Self::Rejected { code, .. } => {
                let status = match code {
                    RejectCode::PermissionDenied => StatusCode::FORBIDDEN,
                    RejectCode::InvalidArgument => StatusCode::BAD_REQUEST,
                    RejectCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
                    RejectCode::NotFound => StatusCode::NOT_FOUND,
                };
                (status, Some(code.as_str()))
            }
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        let body = ErrorBody {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}
