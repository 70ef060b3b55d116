use chrono::{TimeZone, Utc};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use thiserror::Error;
use tracing::debug;

use shared_models::auth::{JwtClaims, User};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("JWT secret is not set")]
    SecretNotConfigured,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token: {0}")]
    Invalid(String),
}

/// Verifies an HS256 bearer token and returns the user it was issued for.
pub fn validate_token(token: &str, jwt_secret: &str) -> Result<User, TokenError> {
    if jwt_secret.is_empty() {
        return Err(TokenError::SecretNotConfigured);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    validation.leeway = 5;

    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => {
            debug!("Token expired");
            TokenError::Expired
        }
        ErrorKind::InvalidSignature => TokenError::Invalid("Invalid token signature".to_string()),
        other => {
            debug!("Token rejected: {:?}", other);
            TokenError::Invalid("Invalid token format".to_string())
        }
    })?;

    let claims = data.claims;
    if claims.sub.is_empty() {
        return Err(TokenError::Invalid("Token has no subject".to_string()));
    }

    let created_at = claims
        .iat
        .and_then(|timestamp| Utc.timestamp_opt(timestamp as i64, 0).single());

    let user = User {
        id: claims.sub,
        email: claims.email,
        role: claims.role,
        metadata: claims.user_metadata,
        created_at,
    };

    debug!("Token validated successfully for user: {}", user.id);
    Ok(user)
}
