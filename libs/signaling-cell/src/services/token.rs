use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use shared_config::AppConfig;

use crate::error::SignalingError;
use crate::models::{CallCredentials, CallTokenRole};

type HmacSha256 = Hmac<Sha256>;

/// Issues the join credentials a client presents to the RTC provider.
pub trait CallTokenIssuer: Send + Sync {
    fn issue(
        &self,
        channel_id: &str,
        user_id: &str,
        role: CallTokenRole,
        ttl: Duration,
    ) -> Result<CallCredentials, SignalingError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallTokenClaims {
    pub app_id: String,
    pub channel: String,
    pub uid: String,
    pub role: CallTokenRole,
    pub iat: i64,
    pub exp: i64,
}

/// `base64url(claims) "." base64url(HMAC-SHA256(app certificate, claims))`
pub struct HmacCallTokenIssuer {
    app_id: String,
    app_certificate: String,
}

impl HmacCallTokenIssuer {
    pub fn new(app_id: impl Into<String>, app_certificate: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_certificate: app_certificate.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        if !config.is_rtc_configured() {
            warn!("RTC credentials are not configured; call tokens cannot be issued");
        }
        Self::new(config.rtc_app_id.clone(), config.rtc_app_certificate.clone())
    }

    fn mac(&self) -> Result<HmacSha256, SignalingError> {
        HmacSha256::new_from_slice(self.app_certificate.as_bytes())
            .map_err(|e| SignalingError::NotConfigured(format!("Invalid RTC app certificate: {}", e)))
    }

    /// Checks the signature and expiry of a token issued by this issuer.
    pub fn verify(&self, token: &str) -> Result<CallTokenClaims, SignalingError> {
        let invalid = || SignalingError::Validation("Invalid call token".to_string());

        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| invalid())?;

        let claims_json = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let claims: CallTokenClaims = serde_json::from_slice(&claims_json)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(SignalingError::Validation("Call token has expired".to_string()));
        }
        Ok(claims)
    }
}

impl CallTokenIssuer for HmacCallTokenIssuer {
    fn issue(
        &self,
        channel_id: &str,
        user_id: &str,
        role: CallTokenRole,
        ttl: Duration,
    ) -> Result<CallCredentials, SignalingError> {
        if self.app_id.is_empty() || self.app_certificate.is_empty() {
            return Err(SignalingError::NotConfigured(
                "RTC app id or certificate is not configured".to_string(),
            ));
        }

        let issued_at = Utc::now().timestamp();
        let expires_at = issued_at + ttl.as_secs() as i64;

        let claims = CallTokenClaims {
            app_id: self.app_id.clone(),
            channel: channel_id.to_string(),
            uid: user_id.to_string(),
            role,
            iat: issued_at,
            exp: expires_at,
        };

        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        debug!("Issued call token for user {} on channel {}", user_id, channel_id);

        Ok(CallCredentials {
            token: format!("{}.{}", payload, signature),
            app_id: self.app_id.clone(),
            channel_id: channel_id.to_string(),
            uid: user_id.to_string(),
            role,
            expires_at: Utc
                .timestamp_opt(expires_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}
