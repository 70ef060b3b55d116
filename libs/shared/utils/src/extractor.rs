use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::jwt::{validate_token, TokenError};

/// Strips the `Bearer ` scheme from an Authorization header value.
pub fn parse_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    let scheme = value.get(..7)?;
    if !scheme.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = value[7..].trim();
    (!token.is_empty()).then_some(token)
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer)
        .map(str::to_string)
}

// Middleware for authentication
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_from_headers(request.headers())
        .ok_or_else(|| AppError::Auth("Missing or invalid authorization header".to_string()))?;

    let user = validate_token(&token, &config.jwt_secret).map_err(|e| match e {
        TokenError::SecretNotConfigured => {
            AppError::ServiceUnavailable("Authentication is not configured".to_string())
        }
        other => AppError::Auth(other.to_string()),
    })?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

// Function to extract user from request extensions
pub fn extract_user<B>(request: &Request<B>) -> Result<User, AppError> {
    request
        .extensions()
        .get::<User>()
        .cloned()
        .ok_or_else(|| AppError::Auth("User not found in request extensions".to_string()))
}
