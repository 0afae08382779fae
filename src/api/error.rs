use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CatalogError, Params};

static DEBUG_ERRORS: AtomicBool = AtomicBool::new(true);

/// Attach debug strings to error bodies; off in production mode.
pub fn set_debug_errors(enabled: bool) {
    DEBUG_ERRORS.store(enabled, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

#[derive(Debug)]
pub struct ApiError(pub CatalogError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn body(&self) -> ErrorResponse {
        let err = &self.0;
        let debug = DEBUG_ERRORS.load(Ordering::Relaxed);
        let (message, debug) = match err {
            CatalogError::Internal(e) => (
                "Internal server error".to_string(),
                debug.then(|| format!("{:#}", e)),
            ),
            other => (other.to_string(), None),
        };
        ErrorResponse {
            status: err.status(),
            code: err.code().to_string(),
            message,
            params: err.params().filter(|p| !p.is_empty()).cloned(),
            debug,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let CatalogError::Internal(e) = &self.0 {
            log::error!("Request failed: {:#}", e);
        }
        let body = self.body();
        let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn test_envelope_carries_code_and_params() {
        let body = ApiError(CatalogError::package_not_found("acme.pay")).body();
        assert_eq!(body.status, 404);
        assert_eq!(body.code, codes::PACKAGE_NOT_FOUND);
        assert_eq!(body.params.unwrap().get("id").map(String::as_str), Some("acme.pay"));
        assert!(body.debug.is_none());
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let body = ApiError(CatalogError::Internal(anyhow::anyhow!("connection reset"))).body();
        assert_eq!(body.status, 500);
        assert_eq!(body.message, "Internal server error");
        assert!(body.params.is_none());
    }
}
