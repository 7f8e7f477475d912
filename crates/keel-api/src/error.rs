//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keel_core::Error;
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// A collaborator (vault, broker) failed the request.
    BadGateway(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::ConstraintViolation(msg) => ApiError::Conflict(msg),
            Error::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            Error::SecretUnavailable { .. } | Error::DispatchFailure(_) => {
                ApiError::BadGateway(err.to_string())
            }
            Error::ResourceExhausted(msg) | Error::Unavailable(msg) => ApiError::Unavailable(msg),
            Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<keel_db::DbError> for ApiError {
    fn from(err: keel_db::DbError) -> Self {
        Error::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::BuildStatus;

    fn status_of(err: Error) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            status_of(Error::InvalidArgument("page".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::NotFound("build 1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Error::InvalidTransition {
                from: BuildStatus::Canceled,
                to: BuildStatus::Success
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::SecretUnavailable {
                name: "TOKEN".into(),
                reason: "not found".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(Error::ResourceExhausted("numbers".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(Error::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_db_errors() {
        assert_eq!(
            ApiError::from(keel_db::DbError::Duplicate("build 1".into()))
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
    }
}
