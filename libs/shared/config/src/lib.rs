use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub redis_url: Option<String>,
    pub rtc_app_id: String,
    pub rtc_app_certificate: String,
    pub rtc_token_ttl_secs: u64,
    pub call_ring_timeout_secs: u64,
    pub store_operation_timeout_ms: u64,
    pub room_summary_delay_ms: u64,
    pub cleanup_interval_secs: u64,
    pub socket_auth_timeout_secs: u64,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            redis_url: None,
            rtc_app_id: String::new(),
            rtc_app_certificate: String::new(),
            rtc_token_ttl_secs: 3600,
            call_ring_timeout_secs: 30,
            store_operation_timeout_ms: 250,
            room_summary_delay_ms: 100,
            cleanup_interval_secs: 30,
            socket_auth_timeout_secs: 5,
            port: 3000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("JWT_SECRET not set, socket and API authentication will reject every token");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()).or_else(|| {
                warn!("REDIS_URL not set, ephemeral state will be kept in process memory");
                None
            }),
            rtc_app_id: env::var("RTC_APP_ID")
                .unwrap_or_else(|_| {
                    warn!("RTC_APP_ID not set, using empty value");
                    String::new()
                }),
            rtc_app_certificate: env::var("RTC_APP_CERTIFICATE")
                .unwrap_or_else(|_| {
                    warn!("RTC_APP_CERTIFICATE not set, using empty value");
                    String::new()
                }),
            rtc_token_ttl_secs: parse_or("RTC_TOKEN_TTL_SECS", defaults.rtc_token_ttl_secs),
            call_ring_timeout_secs: parse_or("CALL_RING_TIMEOUT_SECS", defaults.call_ring_timeout_secs),
            store_operation_timeout_ms: parse_or("STORE_OPERATION_TIMEOUT_MS", defaults.store_operation_timeout_ms),
            room_summary_delay_ms: parse_or("ROOM_SUMMARY_DELAY_MS", defaults.room_summary_delay_ms),
            cleanup_interval_secs: parse_or("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval_secs),
            socket_auth_timeout_secs: parse_or("SOCKET_AUTH_TIMEOUT_SECS", defaults.socket_auth_timeout_secs),
            port: parse_or("PORT", defaults.port),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.jwt_secret.is_empty()
    }

    pub fn is_rtc_configured(&self) -> bool {
        !self.rtc_app_id.is_empty() && !self.rtc_app_certificate.is_empty()
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.call_ring_timeout_secs)
    }

    pub fn store_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.store_operation_timeout_ms)
    }

    pub fn room_summary_delay(&self) -> Duration {
        Duration::from_millis(self.room_summary_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn socket_auth_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_auth_timeout_secs)
    }

    pub fn rtc_token_ttl(&self) -> Duration {
        Duration::from_secs(self.rtc_token_ttl_secs)
    }
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_not_configured() {
        let config = AppConfig::default();
        assert!(!config.is_configured());
        assert!(!config.is_rtc_configured());
        assert_eq!(config.ring_timeout(), Duration::from_secs(30));
        assert_eq!(config.store_operation_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_cleanup_interval_never_zero() {
        let config = AppConfig {
            cleanup_interval_secs: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.cleanup_interval(), Duration::from_secs(1));
    }
}
