use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{CallActionRequest, InitiateCallRequest, PresenceResponse, SendMessageRequest};
use crate::services::relay::validate_room_id;
use crate::socket::new_message;
use crate::state::SignalingState;

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub clear: Option<bool>,
}

// ==============================================================================
// HEALTH
// ==============================================================================

pub async fn signaling_health(State(state): State<Arc<SignalingState>>) -> Json<Value> {
    let store = state.store.health();

    Json(json!({
        "status": if store.degraded { "degraded" } else { "healthy" },
        "service": "signaling-cell",
        "store": store,
        "connections": state.registry.connection_count().await,
        "online_users": state.registry.connected_users().await.len(),
        "rooms": state.relay.room_count().await,
        "auth_configured": state.config.is_configured(),
        "rtc_configured": state.config.is_rtc_configured(),
    }))
}

// ==============================================================================
// CALLS
// ==============================================================================

#[axum::debug_handler]
pub async fn initiate_call(
    State(state): State<Arc<SignalingState>>,
    Extension(user): Extension<User>,
    Json(request): Json<InitiateCallRequest>,
) -> Result<Json<Value>, AppError> {
    let response = state.calls.initiate_call(&user, request).await?;

    Ok(Json(json!({
        "success": true,
        "call": response.call,
        "delivery": response.delivery,
        "credentials": response.credentials,
    })))
}

#[axum::debug_handler]
pub async fn get_call(
    State(state): State<Arc<SignalingState>>,
    Path(call_id): Path<String>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let call = state.calls.get_call(&user, &call_id).await?;

    Ok(Json(json!({ "call": call })))
}

#[axum::debug_handler]
pub async fn accept_call(
    State(state): State<Arc<SignalingState>>,
    Path(call_id): Path<String>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let response = state.calls.accept_call(&user, &call_id).await?;

    Ok(Json(json!({
        "success": true,
        "call": response.call,
        "credentials": response.credentials,
    })))
}

#[axum::debug_handler]
pub async fn decline_call(
    State(state): State<Arc<SignalingState>>,
    Path(call_id): Path<String>,
    Extension(user): Extension<User>,
    request: Option<Json<CallActionRequest>>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = request.unwrap_or_default();
    let call = state.calls.decline_call(&user, &call_id, request.reason).await?;

    Ok(Json(json!({ "success": true, "call": call })))
}

#[axum::debug_handler]
pub async fn end_call(
    State(state): State<Arc<SignalingState>>,
    Path(call_id): Path<String>,
    Extension(user): Extension<User>,
    request: Option<Json<CallActionRequest>>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = request.unwrap_or_default();
    let call = state.calls.end_call(&user, &call_id, request.reason).await?;

    Ok(Json(json!({ "success": true, "call": call })))
}

// ==============================================================================
// PRESENCE & ROOMS
// ==============================================================================

pub async fn get_presence(
    State(state): State<Arc<SignalingState>>,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let device_count = state.registry.device_count(&user_id).await;

    Json(PresenceResponse {
        user_id,
        online: device_count > 0,
        device_count,
    })
}

#[axum::debug_handler]
pub async fn get_room_members(
    State(state): State<Arc<SignalingState>>,
    Path(room_id): Path<String>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    validate_room_id(&room_id).map_err(AppError::from)?;
    debug!("User {} requested members of room {}", user.id, room_id);

    let summary = state.relay.room_summary(&room_id).await;

    Ok(Json(json!({
        "room_id": summary.room_id,
        "member_count": summary.member_count,
        "users": summary.unique_users,
    })))
}

/// Broadcasts a chat message to the room. A recipient who is not in the room
/// gets it on their devices, or queued when offline.
#[axum::debug_handler]
pub async fn send_room_message(
    State(state): State<Arc<SignalingState>>,
    Path(room_id): Path<String>,
    Extension(user): Extension<User>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Value>, AppError> {
    validate_room_id(&room_id).map_err(AppError::from)?;
    let event = new_message(&room_id, &user.id, &request.message, request.message_type)
        .map_err(AppError::from)?;

    let delivered = state.relay.send_to_room(&room_id, event.clone(), None).await;

    let recipient = match request.recipient_id.as_deref().map(str::trim) {
        Some(recipient_id) if !recipient_id.is_empty() && recipient_id != user.id => {
            let summary = state.relay.room_summary(&room_id).await;
            if summary.contains_user(recipient_id) {
                None
            } else {
                Some(state.calls.deliver_or_queue(recipient_id, event.clone()).await)
            }
        }
        _ => None,
    };

    info!("User {} sent a message to room {} ({} delivered)", user.id, room_id, delivered);

    Ok(Json(json!({
        "success": true,
        "message": event,
        "delivered": delivered,
        "recipient_delivery": recipient,
    })))
}

// ==============================================================================
// QUEUED NOTIFICATIONS
// ==============================================================================

#[axum::debug_handler]
pub async fn get_notifications(
    State(state): State<Arc<SignalingState>>,
    Extension(user): Extension<User>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<Value>, AppError> {
    let notifications = if query.clear.unwrap_or(false) {
        state.store.take_queued_notifications(&user.id).await
    } else {
        state.store.get_queued_notifications(&user.id).await
    };

    Ok(Json(json!({
        "count": notifications.len(),
        "notifications": notifications,
    })))
}
