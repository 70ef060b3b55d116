use serde::Serialize;
use thiserror::Error;

use shared_models::error::AppError;
use shared_utils::jwt::TokenError;

use crate::models::CallStatus;

/// Why a socket handshake was refused. The code is sent to the client in
/// the `connection_error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    MissingToken,
    NotConfigured,
    InvalidToken,
    TokenExpired,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::MissingToken => "missing_token",
            AuthFailure::NotConfigured => "auth_not_configured",
            AuthFailure::InvalidToken => "invalid_token",
            AuthFailure::TokenExpired => "token_expired",
        }
    }
}

impl From<TokenError> for AuthFailure {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::SecretNotConfigured => AuthFailure::NotConfigured,
            TokenError::Expired => AuthFailure::TokenExpired,
            TokenError::Invalid(_) => AuthFailure::InvalidToken,
        }
    }
}

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Authentication failed: {message}")]
    Authentication { reason: AuthFailure, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Invalid call status transition from {from} to {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded for {operation}")]
    RateLimited { operation: String },

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SignalingError {
    pub fn authentication(reason: AuthFailure, message: impl Into<String>) -> Self {
        SignalingError::Authentication {
            reason,
            message: message.into(),
        }
    }

    /// Machine-readable code used in `error` and `connection_error` events.
    pub fn code(&self) -> &'static str {
        match self {
            SignalingError::Authentication { reason, .. } => reason.code(),
            SignalingError::Validation(_) | SignalingError::Serialization(_) => "validation_error",
            SignalingError::NotFound(_) => "not_found",
            SignalingError::Authorization(_) => "not_authorized",
            SignalingError::InvalidTransition { .. } => "invalid_transition",
            SignalingError::Conflict(_) => "conflict",
            SignalingError::RateLimited { .. } => "rate_limited",
            SignalingError::NotConfigured(_) => "not_configured",
        }
    }
}

impl From<TokenError> for SignalingError {
    fn from(error: TokenError) -> Self {
        let message = error.to_string();
        SignalingError::authentication(AuthFailure::from(error), message)
    }
}

impl From<SignalingError> for AppError {
    fn from(error: SignalingError) -> Self {
        match error {
            SignalingError::Authentication { message, .. } => AppError::Auth(message),
            SignalingError::Validation(message) => AppError::ValidationError(message),
            SignalingError::Serialization(e) => AppError::BadRequest(e.to_string()),
            SignalingError::NotFound(message) => AppError::NotFound(message),
            SignalingError::Authorization(message) => AppError::Forbidden(message),
            e @ SignalingError::InvalidTransition { .. } => AppError::Conflict(e.to_string()),
            SignalingError::Conflict(message) => AppError::Conflict(message),
            e @ SignalingError::RateLimited { .. } => AppError::TooManyRequests(e.to_string()),
            SignalingError::NotConfigured(message) => AppError::ServiceUnavailable(message),
        }
    }
}

/// Failures of a state backend. These never reach callers of the store:
/// they switch it to the in-process tier instead.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Key '{0}' holds a value of another type")]
    WrongType(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
