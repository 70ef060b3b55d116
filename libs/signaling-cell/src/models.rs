use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::ServerEvent;

pub type ConnectionId = Uuid;

// ==============================================================================
// PARTICIPANTS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Patient,
    Doctor,
    Admin,
}

impl UserRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "patient" => Some(UserRole::Patient),
            "doctor" => Some(UserRole::Doctor),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Patient => "patient",
            UserRole::Doctor => "doctor",
            UserRole::Admin => "admin",
        }
    }
}

// ==============================================================================
// CALL STATE
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Active,
    Declined,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Declined | CallStatus::Missed | CallStatus::Ended)
    }

    pub fn can_transition_to(&self, next: &CallStatus) -> bool {
        use CallStatus::*;

        matches!(
            (self, next),
            (Ringing, Accepted)
                | (Ringing, Declined)
                | (Ringing, Missed)
                | (Ringing, Ended)
                | (Accepted, Active)
                | (Accepted, Ended)
                | (Active, Ended)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Active => "active",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
            CallStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    #[default]
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallMetadata {
    pub caller_id: String,
    pub callee_id: String,
    pub call_type: CallType,
}

/// Transient call state kept in the ephemeral store for 24h.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallStatusRecord {
    pub call_id: String,
    pub status: CallStatus,
    pub metadata: CallMetadata,
    pub updated_at: DateTime<Utc>,
}

impl CallStatusRecord {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.metadata.caller_id == user_id || self.metadata.callee_id == user_id
    }

    /// The counterpart of `user_id` in this call, if `user_id` takes part in it.
    pub fn other_party(&self, user_id: &str) -> Option<&str> {
        if self.metadata.caller_id == user_id {
            Some(&self.metadata.callee_id)
        } else if self.metadata.callee_id == user_id {
            Some(&self.metadata.caller_id)
        } else {
            None
        }
    }
}

// ==============================================================================
// QUEUED NOTIFICATIONS & ROOMS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedNotification {
    pub id: Uuid,
    pub event: ServerEvent,
    pub queued_at: DateTime<Utc>,
}

impl QueuedNotification {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            queued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomSummary {
    pub room_id: String,
    pub member_count: usize,
    pub unique_users: Vec<String>,
}

impl RoomSummary {
    pub fn contains_user(&self, user_id: &str) -> bool {
        self.unique_users.iter().any(|id| id == user_id)
    }
}

/// How an event reached its recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Live { devices: usize },
    Queued,
}

// ==============================================================================
// RTC CREDENTIALS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallTokenRole {
    Publisher,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallCredentials {
    pub token: String,
    pub app_id: String,
    pub channel_id: String,
    pub uid: String,
    pub role: CallTokenRole,
    pub expires_at: DateTime<Utc>,
}

// ==============================================================================
// REQUEST / RESPONSE DTOs
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct InitiateCallRequest {
    pub callee_id: String,
    pub call_type: Option<CallType>,
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallActionRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiateCallResponse {
    pub call: CallStatusRecord,
    pub delivery: DeliveryOutcome,
    pub credentials: CallCredentials,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptCallResponse {
    pub call: CallStatusRecord,
    pub credentials: CallCredentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub message_type: Option<String>,
    pub recipient_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: String,
    pub online: bool,
    pub device_count: usize,
}
