use axum::{async_trait, extract::FromRequestParts, http::request::Parts, http::HeaderMap};

use crate::api::error::ApiError;
use crate::api::handlers::AppState;
use crate::error::{codes, CatalogError};
use crate::model::Principal;
use crate::store::traits::Store;

pub const API_KEY_HEADER: &str = "api-key";

/// Caller identity from request headers.
///
/// - `api-key`: third-party key, resolved against the store on every request
/// - `X-User-Id`: authenticated user, with optional `X-User-Email` and
///   `X-User-Name`
///
/// Requests with neither are rejected as unauthenticated.
#[async_trait]
impl<S: Store + 'static> FromRequestParts<AppState<S>> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState<S>) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        if let Some(token) = extract_header_value(headers, API_KEY_HEADER) {
            return Ok(state.auth.resolve_api_key(&token).await?);
        }
        if let Some(user_id) = extract_header_value(headers, "x-user-id") {
            let user_email = extract_header_value(headers, "x-user-email");
            let user_name = extract_header_value(headers, "x-user-name");
            return Ok(Principal::with_details(user_id, user_email, user_name));
        }
        Err(CatalogError::forbidden(codes::UNAUTHENTICATED, "Authentication is required").into())
    }
}

fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    #[test]
    fn test_header_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("x-user-id"), HeaderValue::from_static("alice"));
        headers.insert(HeaderName::from_static("x-user-email"), HeaderValue::from_static(" "));

        assert_eq!(extract_header_value(&headers, "x-user-id"), Some("alice".to_string()));
        assert_eq!(extract_header_value(&headers, "x-user-email"), None);
        assert_eq!(extract_header_value(&headers, API_KEY_HEADER), None);
    }
}
