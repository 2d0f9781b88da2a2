use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use query::QueryError;

/// Error returned by handlers, rendered as `{"error", "code"}` JSON
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Query(QueryError),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Query(err) => query_status(err),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Query(err) => err.code(),
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => msg.clone(),
            ApiError::Query(err) => err.to_string(),
            ApiError::Internal(err) => format!("{:#}", err),
        }
    }
}

pub fn query_status(err: &QueryError) -> StatusCode {
    match err {
        QueryError::Validation(_) => StatusCode::BAD_REQUEST,
        QueryError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        QueryError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        QueryError::Upstream { .. } | QueryError::MalformedFragment(_) => StatusCode::BAD_GATEWAY,
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError::Query(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.message(), "Request failed");
        }
        let body = Json(json!({
            "error": self.message(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_statuses() {
        assert_eq!(
            ApiError::from(QueryError::Validation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(QueryError::UpstreamUnavailable { service: "embedder" }).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(QueryError::UpstreamTimeout { service: "generator" }).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(QueryError::Upstream {
                service: "vector_store",
                message: "boom".into()
            })
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_internal_error_keeps_chain() {
        let err = ApiError::from(anyhow::anyhow!("disk full").context("Failed to index"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "Failed to index: disk full");
    }
}
