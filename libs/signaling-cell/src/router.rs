use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::*;
use crate::socket::websocket_handler;
use crate::state::SignalingState;

/// Signaling routes, nested under `/signaling` by the API.
pub fn signaling_routes(state: Arc<SignalingState>) -> Router {
    // The socket authenticates its own handshake
    let public_routes = Router::new()
        .route("/health", get(signaling_health))
        .route("/ws", get(websocket_handler));

    let protected_routes = Router::new()
        // Call lifecycle
        .route("/calls", post(initiate_call))
        .route("/calls/{call_id}", get(get_call))
        .route("/calls/{call_id}/accept", post(accept_call))
        .route("/calls/{call_id}/decline", post(decline_call))
        .route("/calls/{call_id}/end", post(end_call))

        // Presence and rooms
        .route("/presence/{user_id}", get(get_presence))
        .route("/rooms/{room_id}/members", get(get_room_members))
        .route("/rooms/{room_id}/messages", post(send_room_message))

        // Offline delivery
        .route("/notifications", get(get_notifications))

        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
