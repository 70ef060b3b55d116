#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};
use signaling_cell::events::{ServerEvent, ServerMessage};
use signaling_cell::services::registry::{EventReceiver, Handshake};
use signaling_cell::services::{CallTokenIssuer, EphemeralStateStore};
use signaling_cell::socket::SocketSession;
use signaling_cell::SignalingState;

pub fn test_state() -> Arc<SignalingState> {
    Arc::new(SignalingState::in_memory(TestConfig::default().to_arc()))
}

pub fn state_with_issuer(issuer: Arc<dyn CallTokenIssuer>) -> Arc<SignalingState> {
    Arc::new(SignalingState::with_components(
        TestConfig::default().to_arc(),
        EphemeralStateStore::in_memory(),
        issuer,
    ))
}

pub fn token_for(user: &TestUser) -> String {
    JwtTestUtils::create_test_token(user, &TestConfig::default().jwt_secret, Some(1))
}

pub fn handshake_for(user: &TestUser) -> Handshake {
    Handshake {
        query_token: Some(token_for(user)),
        ..Handshake::default()
    }
}

/// Opens an authenticated session the way the socket task does.
pub async fn connect(state: &Arc<SignalingState>, user: &TestUser) -> (SocketSession, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = SocketSession::open(state.clone(), &handshake_for(user), tx)
        .await
        .expect("test token should authenticate");
    (session, rx)
}

/// Lets spawned delivery tasks (room updates, ring timers) run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn drain_messages(rx: &mut EventReceiver) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

pub fn drain(rx: &mut EventReceiver) -> Vec<ServerEvent> {
    drain_messages(rx).into_iter().map(|message| message.event).collect()
}

pub fn names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

pub fn join_frame(room_id: &str) -> String {
    format!(r#"{{"event":"join_room","data":{{"room_id":"{}"}}}}"#, room_id)
}

pub fn leave_frame(room_id: &str) -> String {
    format!(r#"{{"event":"leave_room","data":{{"room_id":"{}"}}}}"#, room_id)
}
