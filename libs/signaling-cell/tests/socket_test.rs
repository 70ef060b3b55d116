use assert_matches::assert_matches;
use tokio::sync::mpsc;

use shared_utils::test_utils::{JwtTestUtils, TestUser};
use signaling_cell::error::{AuthFailure, SignalingError};
use signaling_cell::events::{ClientEvent, ServerEvent};
use signaling_cell::models::{CallType, UserRole};
use signaling_cell::services::registry::Handshake;
use signaling_cell::socket::SocketSession;

mod common;
use common::{connect, drain, join_frame, names, settle, test_state};

#[tokio::test]
async fn test_open_greets_with_connected() {
    let state = test_state();
    let doctor = TestUser::doctor("doctor@example.com");

    state
        .store
        .queue_notification(
            &doctor.id,
            ServerEvent::IncomingCall {
                call_id: "call-1".to_string(),
                caller_id: "patient-1".to_string(),
                callee_id: doctor.id.clone(),
                call_type: CallType::Audio,
                timestamp: chrono::Utc::now(),
            },
        )
        .await;

    let (session, mut rx) = connect(&state, &doctor).await;

    assert_eq!(session.user_id(), doctor.id);
    assert_matches!(
        drain(&mut rx).as_slice(),
        [ServerEvent::Connected {
            role: UserRole::Doctor,
            device_count: 1,
            pending_notifications: 1,
            ..
        }]
    );
}

#[tokio::test]
async fn test_open_rejects_bad_credentials() {
    let state = test_state();
    let user = TestUser::default();
    let (tx, _rx) = mpsc::unbounded_channel();

    let handshake = Handshake {
        query_token: Some(JwtTestUtils::create_invalid_signature_token(&user)),
        ..Handshake::default()
    };
    let result = SocketSession::open(state.clone(), &handshake, tx).await;

    let error = match result {
        Err(error) => error,
        Ok(_) => panic!("forged token must be rejected"),
    };
    assert_matches!(
        error,
        SignalingError::Authentication { reason: AuthFailure::InvalidToken, .. }
    );
    assert_eq!(error.code(), "invalid_token");
    assert_eq!(state.registry.connection_count().await, 0);
}

#[tokio::test]
async fn test_authenticate_frame_credential() {
    let state = test_state();
    let user = TestUser::patient("patient@example.com");
    let token = common::token_for(&user);

    let frame = format!(r#"{{"event":"authenticate","data":{{"token":"{}"}}}}"#, token);
    let token_from_frame = match ClientEvent::parse(&frame).unwrap() {
        ClientEvent::Authenticate { token } => token,
        other => panic!("unexpected event {:?}", other),
    };

    let (tx, _rx) = mpsc::unbounded_channel();
    let handshake = Handshake {
        auth_token: Some(token_from_frame),
        ..Handshake::default()
    };
    let session = SocketSession::open(state.clone(), &handshake, tx).await.unwrap();

    assert_eq!(session.user_id(), user.id);
    assert!(state.registry.is_online(&user.id).await);
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let state = test_state();
    let user = TestUser::default();
    let (session, mut rx) = connect(&state, &user).await;
    drain(&mut rx);

    session.dispatch("{not json").await;
    session.dispatch(r#"{"event":"join_room","data":{}}"#).await;
    session.dispatch(r#"{"event":"unknown_event"}"#).await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 3);
    for event in &events {
        assert_matches!(event, ServerEvent::Error { code, .. } if code == "validation_error");
    }
    assert!(state.registry.is_online(&user.id).await);
}

#[tokio::test]
async fn test_ping_pong() {
    let state = test_state();
    let (session, mut rx) = connect(&state, &TestUser::default()).await;
    drain(&mut rx);

    session.dispatch(r#"{"event":"ping","data":{"timestamp":1700000000}}"#).await;
    session.dispatch(r#"{"event":"ping"}"#).await;

    assert_eq!(names(&drain(&mut rx)), vec!["pong", "pong"]);
}

#[tokio::test]
async fn test_typing_requires_membership_and_skips_sender() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_session, mut alice_rx) = connect(&state, &alice).await;
    let (bob_session, mut bob_rx) = connect(&state, &bob).await;
    drain(&mut alice_rx);

    alice_session
        .dispatch(r#"{"event":"typing_start","data":{"room_id":"chat-1"}}"#)
        .await;
    assert_matches!(
        drain(&mut alice_rx).as_slice(),
        [ServerEvent::Error { code, .. }] if code == "not_authorized"
    );

    alice_session.dispatch(&join_frame("chat-1")).await;
    bob_session.dispatch(&join_frame("chat-1")).await;
    settle().await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    alice_session
        .dispatch(r#"{"event":"typing_start","data":{"roomId":"chat-1"}}"#)
        .await;
    alice_session
        .dispatch(r#"{"event":"typing_stop","data":{"room_id":"chat-1"}}"#)
        .await;

    assert!(drain(&mut alice_rx).is_empty());
    let typing: Vec<bool> = drain(&mut bob_rx)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::UserTyping { user_id, is_typing, .. } if user_id == alice.id => Some(is_typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing, vec![true, false]);
}

#[tokio::test]
async fn test_send_message_reaches_all_members() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_session, mut alice_rx) = connect(&state, &alice).await;
    let (bob_session, mut bob_rx) = connect(&state, &bob).await;

    alice_session
        .dispatch(r#"{"event":"join_chat","data":{"roomId":"chat-2"}}"#)
        .await;
    bob_session.dispatch(&join_frame("chat-2")).await;
    settle().await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    alice_session
        .dispatch(r#"{"event":"send_message","data":{"room_id":"chat-2","message":"  hello doctor  "}}"#)
        .await;

    for rx in [&mut alice_rx, &mut bob_rx] {
        assert_matches!(
            drain(rx).as_slice(),
            [ServerEvent::NewMessage { message, message_type, sender_id, .. }]
                if message == "hello doctor" && message_type == "text" && *sender_id == alice.id
        );
    }

    alice_session
        .dispatch(r#"{"event":"send_message","data":{"room_id":"chat-2","message":"   "}}"#)
        .await;
    assert_matches!(
        drain(&mut alice_rx).as_slice(),
        [ServerEvent::Error { code, .. }] if code == "validation_error"
    );
}

#[tokio::test]
async fn test_get_room_members() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_session, mut alice_rx) = connect(&state, &alice).await;
    let (bob_session, _bob_rx) = connect(&state, &bob).await;

    alice_session.dispatch(&join_frame("chat-3")).await;
    bob_session.dispatch(&join_frame("chat-3")).await;
    settle().await;
    drain(&mut alice_rx);

    alice_session
        .dispatch(r#"{"event":"get_room_members","data":{"room_id":"chat-3"}}"#)
        .await;

    let events = drain(&mut alice_rx);
    let (member_count, users) = events
        .iter()
        .find_map(|event| match event {
            ServerEvent::RoomMembers { member_count, users, .. } => Some((*member_count, users.clone())),
            _ => None,
        })
        .expect("room_members reply");

    assert_eq!(member_count, 2);
    assert!(users.contains(&alice.id));
    assert!(users.contains(&bob.id));
}

#[tokio::test]
async fn test_joining_as_someone_else_is_refused() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let (session, mut rx) = connect(&state, &alice).await;
    drain(&mut rx);

    session
        .dispatch(r#"{"event":"join_room","data":{"room_id":"chat-4","user_id":"mallory"}}"#)
        .await;

    assert_matches!(
        drain(&mut rx).as_slice(),
        [ServerEvent::Error { code, .. }] if code == "not_authorized"
    );
    assert_eq!(state.relay.member_count("chat-4").await, 0);
}

#[tokio::test]
async fn test_close_leaves_rooms_and_goes_offline() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_session, _alice_rx) = connect(&state, &alice).await;
    let (bob_session, mut bob_rx) = connect(&state, &bob).await;

    alice_session.dispatch(&join_frame("chat-5")).await;
    bob_session.dispatch(&join_frame("chat-5")).await;
    settle().await;
    drain(&mut bob_rx);

    alice_session.close().await;

    assert!(!state.registry.is_online(&alice.id).await);
    assert_eq!(state.relay.member_count("chat-5").await, 1);
    assert!(drain(&mut bob_rx).iter().any(|event| matches!(
        event,
        ServerEvent::UserLeft { user_id, .. } if *user_id == alice.id
    )));
}
