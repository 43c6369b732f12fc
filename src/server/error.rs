//! LFS API error responses.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;

use crate::batch::{ErrorResponse, MEDIA_TYPE};
use crate::Error;

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Lfs(#[from] Error),

    /// `Accept` does not name the LFS media type.
    #[error("Accept header must be {MEDIA_TYPE}")]
    NotAcceptable,

    /// Request body could not be decoded.
    #[error("invalid request body: {0}")]
    BadRequest(String),

    /// A blocking task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Lfs(e) => match e {
                Error::InvalidPointer(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Error::InvalidRange(_) | Error::InvalidPath(_) | Error::InvalidArgument(_) => {
                    StatusCode::BAD_REQUEST
                }
                Error::SizeMismatch { .. }
                | Error::HashMismatch { .. }
                | Error::ChecksumMismatch { .. }
                | Error::TooLarge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
                Error::NotFound(_) | Error::NotExist(_) => StatusCode::NOT_FOUND,
                Error::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
                Error::LockConflict(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "Internal Server Error".to_string()
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
            self.to_string()
        };
        let body = serde_json::to_vec(&ErrorResponse {
            message,
            documentation_url: None,
            request_id: None,
        })
        .unwrap_or_default();

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, MEDIA_TYPE);
        if status == StatusCode::UNAUTHORIZED {
            builder = builder.header(header::WWW_AUTHENTICATE, "Basic realm=\"lfs-server\"");
        }
        if let Self::Lfs(Error::RangeNotSatisfiable { size, .. }) = &self {
            builder = builder.header(header::CONTENT_RANGE, format!("bytes */{}", size));
        }
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| status.into_response())
    }
}
