use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tidekv::error::Error;

/// Wraps engine errors for the HTTP surface: every error kind maps to a
/// fixed status, with a human-readable message in the JSON body.
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidArgument(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict => StatusCode::CONFLICT,
            Error::TransactionClosed => StatusCode::BAD_REQUEST,
            Error::CorruptKey(_)
            | Error::CorruptValue(_)
            | Error::Io(_)
            | Error::Handler(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            Error::InvalidArgument(_) => "invalid-argument",
            Error::NotFound(_) => "not-found",
            Error::Conflict => "conflict",
            Error::TransactionClosed => "transaction-closed",
            Error::CorruptKey(_) => "corrupt-key",
            Error::CorruptValue(_) => "corrupt-value",
            Error::Io(_) => "io",
            Error::Handler(_) => "handler-error",
            Error::Parse(_) => "parse",
            Error::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {}", self.0);
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

/// Shorthand for handler-level validation failures.
pub fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(Error::InvalidArgument(message.into()))
}
