//! Wire contract of the signaling socket.
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`. Frames
//! relayed to a room also carry `"room": {"room_id", "member_count"}` so
//! clients can sanity-check their view of the room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SignalingError;
use crate::models::{CallStatusRecord, CallType, ConnectionId, UserRole};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
        user_id: String,
        role: UserRole,
        device_count: usize,
        pending_notifications: usize,
        timestamp: DateTime<Utc>,
    },
    ConnectionError {
        code: String,
        message: String,
    },
    IncomingCall {
        call_id: String,
        caller_id: String,
        callee_id: String,
        call_type: CallType,
        timestamp: DateTime<Utc>,
    },
    CallAccepted {
        call_id: String,
        actor_id: String,
        timestamp: DateTime<Utc>,
    },
    CallDeclined {
        call_id: String,
        actor_id: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    CallEnded {
        call_id: String,
        actor_id: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    CallMissed {
        call_id: String,
        caller_id: String,
        callee_id: String,
        timestamp: DateTime<Utc>,
    },
    RoomJoined {
        room_id: String,
        connection_id: ConnectionId,
        member_count: usize,
    },
    UserJoined {
        room_id: String,
        user_id: String,
        connection_id: ConnectionId,
    },
    UserLeft {
        room_id: String,
        user_id: String,
        connection_id: ConnectionId,
    },
    RoomUpdate {
        room_id: String,
        member_count: usize,
        unique_users: usize,
    },
    RoomMembers {
        room_id: String,
        member_count: usize,
        users: Vec<String>,
    },
    NewMessage {
        message_id: Uuid,
        room_id: String,
        sender_id: String,
        message: String,
        message_type: String,
        timestamp: DateTime<Utc>,
    },
    UserTyping {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::ConnectionError { .. } => "connection_error",
            ServerEvent::IncomingCall { .. } => "incoming_call",
            ServerEvent::CallAccepted { .. } => "call_accepted",
            ServerEvent::CallDeclined { .. } => "call_declined",
            ServerEvent::CallEnded { .. } => "call_ended",
            ServerEvent::CallMissed { .. } => "call_missed",
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::RoomUpdate { .. } => "room_update",
            ServerEvent::RoomMembers { .. } => "room_members",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn error(error: &SignalingError) -> Self {
        ServerEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn incoming_call(record: &CallStatusRecord) -> Self {
        ServerEvent::IncomingCall {
            call_id: record.call_id.clone(),
            caller_id: record.metadata.caller_id.clone(),
            callee_id: record.metadata.callee_id.clone(),
            call_type: record.metadata.call_type,
            timestamp: Utc::now(),
        }
    }

    pub fn call_missed(record: &CallStatusRecord) -> Self {
        ServerEvent::CallMissed {
            call_id: record.call_id.clone(),
            caller_id: record.metadata.caller_id.clone(),
            callee_id: record.metadata.callee_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomContext {
    pub room_id: String,
    pub member_count: usize,
}

/// What travels through a connection's outbound channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerMessage {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomContext>,
}

impl ServerMessage {
    pub fn direct(event: ServerEvent) -> Self {
        Self { event, room: None }
    }

    pub fn in_room(event: ServerEvent, room_id: &str, member_count: usize) -> Self {
        Self {
            event,
            room: Some(RoomContext {
                room_id: room_id.to_string(),
                member_count,
            }),
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    #[serde(alias = "join_chat")]
    JoinRoom {
        #[serde(alias = "roomId")]
        room_id: String,
        #[serde(alias = "userId")]
        user_id: Option<String>,
    },
    LeaveRoom {
        #[serde(alias = "roomId")]
        room_id: String,
        #[serde(alias = "userId")]
        user_id: Option<String>,
    },
    TypingStart {
        #[serde(alias = "roomId")]
        room_id: String,
    },
    TypingStop {
        #[serde(alias = "roomId")]
        room_id: String,
    },
    SendMessage {
        #[serde(alias = "roomId")]
        room_id: String,
        message: String,
        message_type: Option<String>,
    },
    GetRoomMembers {
        #[serde(alias = "roomId")]
        room_id: String,
    },
    Ping {
        timestamp: Option<i64>,
    },
}

impl ClientEvent {
    /// Decodes a text frame. A missing `data` field is read as an empty object
    /// so payload-less events such as `{"event":"ping"}` are accepted.
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let frame: Value = serde_json::from_str(text)
            .map_err(|e| SignalingError::Validation(format!("Malformed frame: {}", e)))?;

        let Value::Object(mut fields) = frame else {
            return Err(SignalingError::Validation("Frame must be a JSON object".to_string()));
        };

        let event = match fields.remove("event") {
            Some(Value::String(name)) => name,
            _ => return Err(SignalingError::Validation("Frame has no event name".to_string())),
        };
        let data = match fields.remove("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(data) => data,
        };

        let mut normalized = Map::new();
        normalized.insert("event".to_string(), Value::String(event.clone()));
        normalized.insert("data".to_string(), data);

        serde_json::from_value(Value::Object(normalized))
            .map_err(|e| SignalingError::Validation(format!("Invalid '{}' payload: {}", event, e)))
    }
}
