use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use shared_config::AppConfig;

use crate::error::StoreError;
use crate::events::ServerEvent;
use crate::models::{CallMetadata, CallStatus, CallStatusRecord, QueuedNotification};
use crate::services::memory_backend::MemoryBackend;
use crate::services::redis_backend::RedisBackend;

pub const CALL_STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const NOTIFICATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key/value primitives the ephemeral store is built on.
#[async_trait]
pub trait StateBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Increments a counter, starting its expiry on the first increment.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Appends to a list and refreshes its expiry.
    async fn append_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

fn call_status_key(call_id: &str) -> String {
    format!("call_status:{}", call_id)
}

fn notifications_key(user_id: &str) -> String {
    format!("notifications:{}", user_id)
}

fn rate_limit_key(user_id: &str, operation: &str) -> String {
    format!("rate_limit:{}:{}", user_id, operation)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreHealth {
    pub tier: &'static str,
    pub primary_configured: bool,
    pub degraded: bool,
}

/// TTL-bounded call state, rate-limit counters and offline notifications.
///
/// Reads and writes go to the primary backend (Redis) while it is healthy.
/// A failed or slow primary call flips the store to the in-process tier until
/// the next successful health check. Call status is written to both tiers and
/// read back newest first, so transitions made while degraded survive recovery. Backend errors are logged here and never
/// reach callers.
pub struct EphemeralStateStore {
    primary: Option<Arc<dyn StateBackend>>,
    fallback: Arc<MemoryBackend>,
    primary_healthy: AtomicBool,
    degraded_warned: AtomicBool,
    operation_timeout: Duration,
}

impl EphemeralStateStore {
    pub fn in_memory() -> Self {
        Self {
            primary: None,
            fallback: Arc::new(MemoryBackend::new()),
            primary_healthy: AtomicBool::new(false),
            degraded_warned: AtomicBool::new(false),
            operation_timeout: Duration::from_millis(250),
        }
    }

    pub fn with_primary(primary: Arc<dyn StateBackend>, operation_timeout: Duration) -> Self {
        Self {
            primary: Some(primary),
            fallback: Arc::new(MemoryBackend::new()),
            primary_healthy: AtomicBool::new(true),
            degraded_warned: AtomicBool::new(false),
            operation_timeout,
        }
    }

    /// Uses Redis when `REDIS_URL` is set and answers a PING, the in-process
    /// tier otherwise.
    pub async fn connect(config: &AppConfig) -> Self {
        let Some(redis_url) = config.redis_url.as_deref() else {
            info!("REDIS_URL not set, ephemeral state is kept in process");
            return Self::in_memory();
        };

        match RedisBackend::new(redis_url) {
            Ok(backend) => {
                let store = Self::with_primary(Arc::new(backend), config.store_operation_timeout());
                if store.check_health().await {
                    info!("Ephemeral state store connected to Redis");
                }
                store
            }
            Err(e) => {
                warn!("Invalid Redis configuration, using in-process store: {}", e);
                Self::in_memory()
            }
        }
    }

    // ==========================================================================
    // HEALTH
    // ==========================================================================

    /// Pings the primary and selects the tier. Returns whether the primary is usable.
    pub async fn check_health(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };

        match tokio::time::timeout(self.operation_timeout, primary.ping()).await {
            Ok(Ok(())) => {
                if !self.primary_healthy.swap(true, Ordering::SeqCst) {
                    info!("State backend '{}' recovered, leaving degraded mode", primary.name());
                }
                self.degraded_warned.store(false, Ordering::SeqCst);
                true
            }
            Ok(Err(e)) => {
                self.mark_degraded("ping", &e);
                false
            }
            Err(_) => {
                self.mark_degraded("ping", &self.timeout_error("ping"));
                false
            }
        }
    }

    /// True while a configured primary is unavailable.
    pub fn is_degraded(&self) -> bool {
        self.primary.is_some() && !self.primary_healthy.load(Ordering::SeqCst)
    }

    pub fn tier(&self) -> &'static str {
        match self.active_primary() {
            Some(primary) => primary.name(),
            None => self.fallback.name(),
        }
    }

    pub fn health(&self) -> StoreHealth {
        StoreHealth {
            tier: self.tier(),
            primary_configured: self.primary.is_some(),
            degraded: self.is_degraded(),
        }
    }

    pub async fn purge_expired(&self) -> usize {
        self.fallback.purge_expired().await
    }

    // ==========================================================================
    // CALL STATUS
    // ==========================================================================

    pub async fn set_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
        metadata: CallMetadata,
    ) -> CallStatusRecord {
        let record = CallStatusRecord {
            call_id: call_id.to_string(),
            status,
            metadata,
            updated_at: Utc::now(),
        };

        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize call status for {}: {}", call_id, e);
                return record;
            }
        };

        let key = call_status_key(call_id);
        // the in-process copy is always kept so a primary outage never hides a
        // call this instance has seen
        if let Err(e) = self.fallback.set_with_ttl(&key, payload.clone(), CALL_STATUS_TTL).await {
            warn!("In-process store rejected call status for {}: {}", call_id, e);
        }

        let on_primary = match self.active_primary() {
            Some(primary) => self
                .on_primary("set_call_status", primary.set_with_ttl(&key, payload, CALL_STATUS_TTL))
                .await
                .is_some(),
            None => false,
        };

        if on_primary {
            debug!("Call {} stored as {}", call_id, status);
        } else {
            debug!("Call {} stored as {} (in process)", call_id, status);
        }
        record
    }

    /// Reads both tiers and returns the most recently updated record.
    pub async fn get_call_status(&self, call_id: &str) -> Option<CallStatusRecord> {
        let key = call_status_key(call_id);

        let mut candidates = Vec::with_capacity(2);
        if let Some(primary) = self.active_primary() {
            candidates.extend(self.on_primary("get_call_status", primary.get(&key)).await.flatten());
        }
        candidates.extend(self.fallback.get(&key).await.unwrap_or_else(|e| {
            warn!("In-process store failed to read {}: {}", key, e);
            None
        }));

        candidates
            .into_iter()
            .filter_map(|raw| match serde_json::from_str::<CallStatusRecord>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Discarding unreadable call status for {}: {}", call_id, e);
                    None
                }
            })
            .max_by_key(|record| record.updated_at)
    }

    // ==========================================================================
    // RATE LIMITING
    // ==========================================================================

    /// Counts one attempt and returns whether it is within `limit` for the
    /// current window. Always allows while the configured primary is down.
    pub async fn check_rate_limit(
        &self,
        user_id: &str,
        operation: &str,
        limit: u32,
        window_secs: u64,
    ) -> bool {
        let key = rate_limit_key(user_id, operation);
        let window = Duration::from_secs(window_secs.max(1));

        let count = if self.primary.is_some() {
            let Some(primary) = self.active_primary() else {
                debug!("Rate limit for {} skipped: store degraded", key);
                return true;
            };
            match self
                .on_primary("check_rate_limit", primary.increment_with_ttl(&key, window))
                .await
            {
                Some(count) => count,
                None => return true,
            }
        } else {
            match self.fallback.increment_with_ttl(&key, window).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("In-process rate limit failed for {}: {}", key, e);
                    return true;
                }
            }
        };

        let allowed = count <= u64::from(limit);
        if !allowed {
            info!("Rate limit hit for user {} on {} ({} > {})", user_id, operation, count, limit);
        }
        allowed
    }

    // ==========================================================================
    // QUEUED NOTIFICATIONS
    // ==========================================================================

    pub async fn queue_notification(&self, user_id: &str, event: ServerEvent) -> QueuedNotification {
        let notification = QueuedNotification::new(event);

        let payload = match serde_json::to_string(&notification) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize notification for {}: {}", user_id, e);
                return notification;
            }
        };

        let key = notifications_key(user_id);
        if let Some(primary) = self.active_primary() {
            let stored = self
                .on_primary(
                    "queue_notification",
                    primary.append_with_ttl(&key, payload.clone(), NOTIFICATION_TTL),
                )
                .await;
            if stored.is_some() {
                info!("Queued {} for offline user {}", notification.event.name(), user_id);
                return notification;
            }
        }

        if let Err(e) = self.fallback.append_with_ttl(&key, payload, NOTIFICATION_TTL).await {
            warn!("In-process store rejected notification for {}: {}", user_id, e);
        }
        info!(
            "Queued {} for offline user {} (in process)",
            notification.event.name(),
            user_id
        );
        notification
    }

    /// Oldest first. Includes anything queued in process while degraded.
    pub async fn get_queued_notifications(&self, user_id: &str) -> Vec<QueuedNotification> {
        let key = notifications_key(user_id);

        let mut raw = Vec::new();
        if let Some(primary) = self.active_primary() {
            raw = self
                .on_primary("get_queued_notifications", primary.list(&key))
                .await
                .unwrap_or_default();
        }
        match self.fallback.list(&key).await {
            Ok(items) => raw.extend(items),
            Err(e) => warn!("In-process store failed to read {}: {}", key, e),
        }

        raw.iter()
            .filter_map(|item| match serde_json::from_str::<QueuedNotification>(item) {
                Ok(notification) => Some(notification),
                Err(e) => {
                    warn!("Skipping unreadable notification for {}: {}", user_id, e);
                    None
                }
            })
            .collect()
    }

    pub async fn clear_queued_notifications(&self, user_id: &str) {
        let key = notifications_key(user_id);
        if let Some(primary) = self.active_primary() {
            self.on_primary("clear_queued_notifications", primary.delete(&key)).await;
        }
        if let Err(e) = self.fallback.delete(&key).await {
            warn!("In-process store failed to clear {}: {}", key, e);
        }
        debug!("Cleared queued notifications for {}", user_id);
    }

    pub async fn take_queued_notifications(&self, user_id: &str) -> Vec<QueuedNotification> {
        let notifications = self.get_queued_notifications(user_id).await;
        if !notifications.is_empty() {
            self.clear_queued_notifications(user_id).await;
        }
        notifications
    }

    // ==========================================================================
    // INTERNALS
    // ==========================================================================

    fn active_primary(&self) -> Option<&Arc<dyn StateBackend>> {
        self.primary
            .as_ref()
            .filter(|_| self.primary_healthy.load(Ordering::SeqCst))
    }

    /// Runs one primary call under the operation timeout. `None` means the
    /// call failed and the store is now degraded.
    async fn on_primary<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.mark_degraded(operation, &e);
                None
            }
            Err(_) => {
                self.mark_degraded(operation, &self.timeout_error(operation));
                None
            }
        }
    }

    fn mark_degraded(&self, operation: &str, error: &StoreError) {
        self.primary_healthy.store(false, Ordering::SeqCst);
        if !self.degraded_warned.swap(true, Ordering::SeqCst) {
            warn!(
                "State backend unavailable during {}, switching to in-process store: {}",
                operation, error
            );
        } else {
            debug!("State backend still unavailable during {}: {}", operation, error);
        }
    }

    fn timeout_error(&self, operation: &'static str) -> StoreError {
        StoreError::Timeout {
            operation,
            timeout_ms: self.operation_timeout.as_millis() as u64,
        }
    }
}
