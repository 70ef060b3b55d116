use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;

use crate::error::SignalingError;
use crate::events::ServerEvent;
use crate::models::{
    AcceptCallResponse, CallMetadata, CallStatus, CallStatusRecord, CallTokenRole,
    DeliveryOutcome, InitiateCallRequest, InitiateCallResponse,
};
use crate::services::relay::{validate_room_id, CallNotice, RoomRelay};
use crate::services::store::EphemeralStateStore;
use crate::services::token::CallTokenIssuer;

pub const INITIATE_CALL_OPERATION: &str = "initiate_call";
pub const INITIATE_CALL_LIMIT: u32 = 5;
pub const INITIATE_CALL_WINDOW_SECS: u64 = 300;

type CallLocks = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Call lifecycle on top of the relay and the ephemeral store.
///
/// Every transition is checked against the call state machine and written
/// back to the store before anyone is notified. Recipients without a live
/// device get the event queued instead. Transitions on one call are
/// serialized; different calls never wait on each other.
#[derive(Clone)]
pub struct CallSignalingService {
    relay: Arc<RoomRelay>,
    store: Arc<EphemeralStateStore>,
    token_issuer: Arc<dyn CallTokenIssuer>,
    ring_timeout: Duration,
    token_ttl: Duration,
    call_locks: CallLocks,
}

impl CallSignalingService {
    pub fn new(
        config: &AppConfig,
        relay: Arc<RoomRelay>,
        store: Arc<EphemeralStateStore>,
        token_issuer: Arc<dyn CallTokenIssuer>,
    ) -> Self {
        Self {
            relay,
            store,
            token_issuer,
            ring_timeout: config.ring_timeout(),
            token_ttl: config.rtc_token_ttl(),
            call_locks: CallLocks::default(),
        }
    }

    pub async fn initiate_call(
        &self,
        caller: &User,
        request: InitiateCallRequest,
    ) -> Result<InitiateCallResponse, SignalingError> {
        let callee_id = request.callee_id.trim();
        if callee_id.is_empty() {
            return Err(SignalingError::Validation("callee_id is required".to_string()));
        }
        if callee_id == caller.id {
            return Err(SignalingError::Validation("Cannot call yourself".to_string()));
        }

        let call_id = match request.call_id {
            Some(call_id) => call_id.trim().to_string(),
            None => format!("call-{}", Uuid::new_v4()),
        };
        validate_room_id(&call_id)?;

        let allowed = self
            .store
            .check_rate_limit(
                &caller.id,
                INITIATE_CALL_OPERATION,
                INITIATE_CALL_LIMIT,
                INITIATE_CALL_WINDOW_SECS,
            )
            .await;
        if !allowed {
            return Err(SignalingError::RateLimited {
                operation: INITIATE_CALL_OPERATION.to_string(),
            });
        }

        let credentials =
            self.token_issuer
                .issue(&call_id, &caller.id, CallTokenRole::Publisher, self.token_ttl)?;

        let record = {
            let _guard = self.lock_call(&call_id).await;

            if let Some(existing) = self.store.get_call_status(&call_id).await {
                if !existing.status.is_terminal() {
                    return Err(SignalingError::Conflict(format!(
                        "Call {} is already {}",
                        call_id, existing.status
                    )));
                }
            }

            let metadata = CallMetadata {
                caller_id: caller.id.clone(),
                callee_id: callee_id.to_string(),
                call_type: request.call_type.unwrap_or_default(),
            };
            self.store
                .set_call_status(&call_id, CallStatus::Ringing, metadata)
                .await
        };

        info!("User {} is calling {} (call {})", caller.id, callee_id, call_id);

        let notice = self.relay.notify_incoming_call(&record).await;
        let delivery = self.settle(notice).await;

        self.spawn_ring_timer(record.clone());

        Ok(InitiateCallResponse {
            call: record,
            delivery,
            credentials,
        })
    }

    pub async fn accept_call(&self, user: &User, call_id: &str) -> Result<AcceptCallResponse, SignalingError> {
        let current = self.get_call(user, call_id).await?;
        ensure_callee(&current, user)?;

        let credentials =
            self.token_issuer
                .issue(call_id, &user.id, CallTokenRole::Publisher, self.token_ttl)?;

        let record = self.transition(call_id, &user.id, CallStatus::Accepted).await?;
        info!("Call {} accepted by {}", call_id, user.id);

        let notice = self.relay.notify_call_accepted(&record, &user.id).await;
        self.settle(notice).await;

        // both sides may already be waiting in the call room
        let record = self.on_room_joined(call_id).await.unwrap_or(record);

        Ok(AcceptCallResponse {
            call: record,
            credentials,
        })
    }

    pub async fn decline_call(
        &self,
        user: &User,
        call_id: &str,
        reason: Option<String>,
    ) -> Result<CallStatusRecord, SignalingError> {
        let current = self.get_call(user, call_id).await?;
        ensure_callee(&current, user)?;

        let record = self.transition(call_id, &user.id, CallStatus::Declined).await?;
        info!("Call {} declined by {}", call_id, user.id);

        let notice = self.relay.notify_call_declined(&record, &user.id, reason).await;
        self.settle(notice).await;

        Ok(record)
    }

    pub async fn end_call(
        &self,
        user: &User,
        call_id: &str,
        reason: Option<String>,
    ) -> Result<CallStatusRecord, SignalingError> {
        self.get_call(user, call_id).await?;

        let record = self.transition(call_id, &user.id, CallStatus::Ended).await?;
        info!("Call {} ended by {}", call_id, user.id);

        self.notify_ended(&record, &user.id, reason).await;
        Ok(record)
    }

    /// Participants only.
    pub async fn get_call(&self, user: &User, call_id: &str) -> Result<CallStatusRecord, SignalingError> {
        let record = self
            .store
            .get_call_status(call_id)
            .await
            .ok_or_else(|| SignalingError::NotFound(format!("Call {} not found", call_id)))?;

        if !record.is_participant(&user.id) {
            return Err(SignalingError::Authorization(format!(
                "User {} is not a participant of call {}",
                user.id, call_id
            )));
        }
        Ok(record)
    }

    /// Moves the call to `missed` if it is still in the ring that produced
    /// `rung`, and tells both sides. A call that moved on since is left alone,
    /// including one that has started a new ring under the same id.
    pub async fn expire_if_unanswered(&self, rung: &CallStatusRecord) -> Option<CallStatusRecord> {
        let call_id = rung.call_id.as_str();
        let record = {
            let _guard = self.lock_call(call_id).await;
            let current = self.store.get_call_status(call_id).await?;
            if current.status != CallStatus::Ringing || current.updated_at != rung.updated_at {
                debug!(
                    "Ring timer for call {} found it {} since {}",
                    call_id, current.status, current.updated_at
                );
                return None;
            }
            self.store
                .set_call_status(call_id, CallStatus::Missed, current.metadata)
                .await
        };

        info!(
            "Call {} from {} to {} was not answered",
            call_id, record.metadata.caller_id, record.metadata.callee_id
        );

        let event = ServerEvent::call_missed(&record);
        self.relay
            .send_to_user(&record.metadata.caller_id, event.clone())
            .await;
        self.deliver_or_queue(&record.metadata.callee_id, event).await;

        Some(record)
    }

    /// Marks an accepted call active once caller and callee are both in its room.
    pub async fn on_room_joined(&self, room_id: &str) -> Option<CallStatusRecord> {
        let summary = self.relay.room_summary(room_id).await;

        let _guard = self.lock_call(room_id).await;
        let current = self.store.get_call_status(room_id).await?;
        if current.status != CallStatus::Accepted
            || !summary.contains_user(&current.metadata.caller_id)
            || !summary.contains_user(&current.metadata.callee_id)
        {
            return None;
        }

        let record = self
            .store
            .set_call_status(room_id, CallStatus::Active, current.metadata)
            .await;
        info!("Call {} is active", room_id);
        Some(record)
    }

    /// Ends a live call when one of its participants has no device left in the call room.
    pub async fn on_room_left(&self, room_id: &str, user_id: &str) -> Option<CallStatusRecord> {
        let summary = self.relay.room_summary(room_id).await;
        if summary.contains_user(user_id) {
            return None;
        }

        let record = {
            let _guard = self.lock_call(room_id).await;
            let current = self.store.get_call_status(room_id).await?;
            if !current.is_participant(user_id)
                || !matches!(current.status, CallStatus::Accepted | CallStatus::Active)
            {
                return None;
            }
            self.store
                .set_call_status(room_id, CallStatus::Ended, current.metadata)
                .await
        };

        info!("Call {} ended: {} left the call room", room_id, user_id);
        self.notify_ended(&record, user_id, Some("participant_left".to_string()))
            .await;
        Some(record)
    }

    /// Pushes to every live device of the user, or queues when there is none.
    pub async fn deliver_or_queue(&self, user_id: &str, event: ServerEvent) -> DeliveryOutcome {
        let devices = self.relay.send_to_user(user_id, event.clone()).await;
        self.settle(CallNotice {
            recipient: user_id.to_string(),
            event,
            devices,
        })
        .await
    }

    /// Queues a notice that reached no device.
    async fn settle(&self, notice: CallNotice) -> DeliveryOutcome {
        if notice.devices > 0 {
            return DeliveryOutcome::Live {
                devices: notice.devices,
            };
        }

        self.store.queue_notification(&notice.recipient, notice.event).await;
        DeliveryOutcome::Queued
    }

    async fn notify_ended(&self, record: &CallStatusRecord, actor_id: &str, reason: Option<String>) {
        match self.relay.notify_call_ended(record, actor_id, reason).await {
            Some(notice) => {
                self.settle(notice).await;
            }
            None => warn!("Call {} ended by non-participant {}", record.call_id, actor_id),
        }
    }

    async fn transition(
        &self,
        call_id: &str,
        actor_id: &str,
        next: CallStatus,
    ) -> Result<CallStatusRecord, SignalingError> {
        let _guard = self.lock_call(call_id).await;

        let current = self
            .store
            .get_call_status(call_id)
            .await
            .ok_or_else(|| SignalingError::NotFound(format!("Call {} not found", call_id)))?;

        if !current.status.can_transition_to(&next) {
            debug!(
                "Rejected {} -> {} on call {} by {}",
                current.status, next, call_id, actor_id
            );
            return Err(SignalingError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        Ok(self
            .store
            .set_call_status(call_id, next, current.metadata)
            .await)
    }

    fn spawn_ring_timer(&self, rung: CallStatusRecord) {
        let service = self.clone();
        let ring_timeout = self.ring_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            service.expire_if_unanswered(&rung).await;
        });
    }

    async fn lock_call(&self, call_id: &str) -> CallGuard {
        let lock = {
            let mut locks = self.call_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(call_id.to_string()).or_default())
        };

        CallGuard {
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(&self.call_locks),
            call_id: call_id.to_string(),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.call_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Holds one call's transition lock. The map entry goes away with the last holder.
struct CallGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: CallLocks,
    call_id: String,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.call_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.call_id);
        }
    }
}

fn ensure_callee(record: &CallStatusRecord, user: &User) -> Result<(), SignalingError> {
    if record.metadata.callee_id != user.id {
        return Err(SignalingError::Authorization(format!(
            "Only the callee can answer call {}",
            record.call_id
        )));
    }
    Ok(())
}
