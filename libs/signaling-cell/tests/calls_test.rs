use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use mockall::mock;

use shared_utils::test_utils::TestUser;
use signaling_cell::error::SignalingError;
use signaling_cell::events::ServerEvent;
use signaling_cell::models::{
    CallCredentials, CallStatus, CallTokenRole, DeliveryOutcome, InitiateCallRequest,
};
use signaling_cell::services::CallTokenIssuer;

mod common;
use common::{connect, drain, join_frame, leave_frame, names, settle, state_with_issuer, test_state};

mock! {
    pub Issuer {}

    impl CallTokenIssuer for Issuer {
        fn issue(
            &self,
            channel_id: &str,
            user_id: &str,
            role: CallTokenRole,
            ttl: Duration,
        ) -> Result<CallCredentials, SignalingError>;
    }
}

fn credentials(channel_id: &str, user_id: &str, role: CallTokenRole) -> CallCredentials {
    CallCredentials {
        token: format!("token-{}-{}", channel_id, user_id),
        app_id: "test-app".to_string(),
        channel_id: channel_id.to_string(),
        uid: user_id.to_string(),
        role,
        expires_at: Utc::now(),
    }
}

fn call_request(callee: &TestUser, call_id: Option<&str>) -> InitiateCallRequest {
    InitiateCallRequest {
        callee_id: callee.id.clone(),
        call_type: None,
        call_id: call_id.map(str::to_string),
    }
}

#[tokio::test]
async fn test_initiate_call_reaches_online_callee() {
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");

    let mut issuer = MockIssuer::new();
    let caller_id = caller.id.clone();
    issuer
        .expect_issue()
        .withf(move |channel, user, role, _| {
            channel == "call-123" && user == caller_id && *role == CallTokenRole::Publisher
        })
        .times(1)
        .returning(|channel, user, role, _| Ok(credentials(channel, user, role)));

    let state = state_with_issuer(Arc::new(issuer));
    let (_callee_session, mut callee_rx) = connect(&state, &callee).await;
    drain(&mut callee_rx);

    let response = state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-123")))
        .await
        .unwrap();

    assert_eq!(response.call.status, CallStatus::Ringing);
    assert_eq!(response.delivery, DeliveryOutcome::Live { devices: 1 });
    assert_eq!(response.credentials.uid, caller.id);

    let events = drain(&mut callee_rx);
    assert_matches!(
        events.as_slice(),
        [ServerEvent::IncomingCall { call_id, caller_id, .. }] if call_id == "call-123" && *caller_id == caller.id
    );
}

#[tokio::test]
async fn test_offline_callee_gets_queued_incoming_call() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("never-connected@example.com");

    let response = state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-123")))
        .await
        .unwrap();

    assert_eq!(response.delivery, DeliveryOutcome::Queued);

    let queued = state.store.get_queued_notifications(&callee.id).await;
    assert_eq!(queued.len(), 1);
    assert_matches!(&queued[0].event, ServerEvent::IncomingCall { call_id, .. } if call_id == "call-123");
}

#[tokio::test]
async fn test_initiate_call_validation() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");

    assert_matches!(
        state
            .calls
            .initiate_call(&caller.to_user(), call_request(&caller, None))
            .await,
        Err(SignalingError::Validation(_))
    );

    let blank = InitiateCallRequest {
        callee_id: "  ".to_string(),
        call_type: None,
        call_id: None,
    };
    assert_matches!(
        state.calls.initiate_call(&caller.to_user(), blank).await,
        Err(SignalingError::Validation(_))
    );

    let callee = TestUser::doctor("doctor@example.com");
    assert_matches!(
        state
            .calls
            .initiate_call(&caller.to_user(), call_request(&callee, Some("not a room id")))
            .await,
        Err(SignalingError::Validation(_))
    );
}

#[tokio::test]
async fn test_initiate_call_is_rate_limited() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");

    for _ in 0..5 {
        state
            .calls
            .initiate_call(&caller.to_user(), call_request(&callee, None))
            .await
            .unwrap();
    }

    assert_matches!(
        state
            .calls
            .initiate_call(&caller.to_user(), call_request(&callee, None))
            .await,
        Err(SignalingError::RateLimited { operation }) if operation == "initiate_call"
    );
}

#[tokio::test]
async fn test_duplicate_live_call_id_conflicts() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");

    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
        .await
        .unwrap();

    assert_matches!(
        state
            .calls
            .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
            .await,
        Err(SignalingError::Conflict(_))
    );
}

#[tokio::test]
async fn test_unconfigured_rtc_records_nothing() {
    let mut issuer = MockIssuer::new();
    issuer
        .expect_issue()
        .returning(|_, _, _, _| Err(SignalingError::NotConfigured("rtc".to_string())));

    let state = state_with_issuer(Arc::new(issuer));
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");

    assert_matches!(
        state
            .calls
            .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
            .await,
        Err(SignalingError::NotConfigured(_))
    );
    assert!(state.store.get_call_status("call-1").await.is_none());
}

#[tokio::test]
async fn test_only_callee_can_accept() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");
    let (_caller_session, mut caller_rx) = connect(&state, &caller).await;

    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
        .await
        .unwrap();
    drain(&mut caller_rx);

    assert_matches!(
        state.calls.accept_call(&caller.to_user(), "call-1").await,
        Err(SignalingError::Authorization(_))
    );

    let accepted = state.calls.accept_call(&callee.to_user(), "call-1").await.unwrap();
    assert_eq!(accepted.call.status, CallStatus::Accepted);
    assert_eq!(accepted.credentials.uid, callee.id);

    assert_matches!(
        drain(&mut caller_rx).as_slice(),
        [ServerEvent::CallAccepted { actor_id, .. }] if *actor_id == callee.id
    );

    assert_matches!(
        state.calls.accept_call(&callee.to_user(), "call-1").await,
        Err(SignalingError::InvalidTransition {
            from: CallStatus::Accepted,
            to: CallStatus::Accepted
        })
    );
}

#[tokio::test]
async fn test_decline_is_terminal() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");

    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
        .await
        .unwrap();

    let declined = state
        .calls
        .decline_call(&callee.to_user(), "call-1", Some("busy".to_string()))
        .await
        .unwrap();
    assert_eq!(declined.status, CallStatus::Declined);

    // the caller was offline, so the decline waits in their queue
    let queued = state.store.get_queued_notifications(&caller.id).await;
    assert_matches!(
        queued.last().map(|n| &n.event),
        Some(ServerEvent::CallDeclined { reason: Some(reason), .. }) if reason == "busy"
    );

    assert_matches!(
        state.calls.end_call(&caller.to_user(), "call-1", None).await,
        Err(SignalingError::InvalidTransition { from: CallStatus::Declined, .. })
    );
}

#[tokio::test]
async fn test_caller_can_cancel_ringing_call() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");
    let (_callee_session, mut callee_rx) = connect(&state, &callee).await;

    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
        .await
        .unwrap();
    drain(&mut callee_rx);

    let ended = state
        .calls
        .end_call(&caller.to_user(), "call-1", Some("cancelled".to_string()))
        .await
        .unwrap();

    assert_eq!(ended.status, CallStatus::Ended);
    assert_eq!(names(&drain(&mut callee_rx)), vec!["call_ended"]);
}

#[tokio::test]
async fn test_call_access_is_limited_to_participants() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");
    let stranger = TestUser::patient("stranger@example.com");

    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
        .await
        .unwrap();

    assert_matches!(
        state.calls.get_call(&stranger.to_user(), "call-1").await,
        Err(SignalingError::Authorization(_))
    );
    assert_matches!(
        state.calls.end_call(&stranger.to_user(), "call-1", None).await,
        Err(SignalingError::Authorization(_))
    );
    assert_matches!(
        state.calls.get_call(&caller.to_user(), "call-404").await,
        Err(SignalingError::NotFound(_))
    );
    assert_eq!(
        state.calls.get_call(&callee.to_user(), "call-1").await.unwrap().status,
        CallStatus::Ringing
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_becomes_missed() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");
    let (_caller_session, mut caller_rx) = connect(&state, &caller).await;

    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
        .await
        .unwrap();
    drain(&mut caller_rx);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(
        state.calls.get_call(&caller.to_user(), "call-1").await.unwrap().status,
        CallStatus::Ringing
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;

    assert_eq!(
        state.calls.get_call(&caller.to_user(), "call-1").await.unwrap().status,
        CallStatus::Missed
    );
    assert_eq!(names(&drain(&mut caller_rx)), vec!["call_missed"]);

    let queued: Vec<&str> = state
        .store
        .get_queued_notifications(&callee.id)
        .await
        .iter()
        .map(|n| n.event.name())
        .collect();
    assert_eq!(queued, vec!["incoming_call", "call_missed"]);
}

#[tokio::test(start_paused = true)]
async fn test_answered_call_is_not_missed() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");

    let initiated = state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-1")))
        .await
        .unwrap();
    state.calls.accept_call(&callee.to_user(), "call-1").await.unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    assert_eq!(
        state.calls.get_call(&caller.to_user(), "call-1").await.unwrap().status,
        CallStatus::Accepted
    );
    assert!(state.calls.expire_if_unanswered(&initiated.call).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_old_ring_timer_leaves_reused_call_id_alone() {
    let state = test_state();
    let caller = TestUser::patient("patient@example.com");
    let callee = TestUser::doctor("doctor@example.com");

    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-x")))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    state
        .calls
        .decline_call(&callee.to_user(), "call-x", None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(15)).await;
    state
        .calls
        .initiate_call(&caller.to_user(), call_request(&callee, Some("call-x")))
        .await
        .unwrap();

    // the first ring's timer fires at 30s, only 10s into the second ring
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(
        state.calls.get_call(&caller.to_user(), "call-x").await.unwrap().status,
        CallStatus::Ringing
    );

    tokio::time::sleep(Duration::from_secs(20)).await;
    settle().await;
    assert_eq!(
        state.calls.get_call(&caller.to_user(), "call-x").await.unwrap().status,
        CallStatus::Missed
    );
}

#[tokio::test]
async fn test_leaving_call_room_ends_active_call() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_session, _alice_rx) = connect(&state, &alice).await;
    let (bob_session, mut bob_rx) = connect(&state, &bob).await;

    state
        .calls
        .initiate_call(&alice.to_user(), call_request(&bob, Some("call-123")))
        .await
        .unwrap();
    state.calls.accept_call(&bob.to_user(), "call-123").await.unwrap();

    alice_session.dispatch(&join_frame("call-123")).await;
    bob_session.dispatch(&join_frame("call-123")).await;
    settle().await;

    assert_eq!(
        state.calls.get_call(&alice.to_user(), "call-123").await.unwrap().status,
        CallStatus::Active
    );
    drain(&mut bob_rx);

    alice_session.dispatch(&leave_frame("call-123")).await;

    let events = drain(&mut bob_rx);
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::UserLeft { user_id, .. } if *user_id == alice.id
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::CallEnded { actor_id, .. } if *actor_id == alice.id
    )));
    assert_eq!(
        state.calls.get_call(&bob.to_user(), "call-123").await.unwrap().status,
        CallStatus::Ended
    );
}

#[tokio::test]
async fn test_disconnect_ends_active_call() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_session, _alice_rx) = connect(&state, &alice).await;
    let (bob_session, mut bob_rx) = connect(&state, &bob).await;

    state
        .calls
        .initiate_call(&alice.to_user(), call_request(&bob, Some("call-7")))
        .await
        .unwrap();
    bob_session.dispatch(&join_frame("call-7")).await;
    alice_session.dispatch(&join_frame("call-7")).await;
    state.calls.accept_call(&bob.to_user(), "call-7").await.unwrap();

    // accepting with both parties already in the room activates the call
    assert_eq!(
        state.calls.get_call(&bob.to_user(), "call-7").await.unwrap().status,
        CallStatus::Active
    );
    settle().await;
    drain(&mut bob_rx);

    alice_session.close().await;

    assert!(names(&drain(&mut bob_rx)).contains(&"call_ended"));
    assert_eq!(
        state.calls.get_call(&bob.to_user(), "call-7").await.unwrap().status,
        CallStatus::Ended
    );
    assert!(!state.registry.is_online(&alice.id).await);
}

#[tokio::test]
async fn test_dead_socket_found_on_push_ends_active_call() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_session, alice_rx) = connect(&state, &alice).await;
    let (bob_session, mut bob_rx) = connect(&state, &bob).await;

    state
        .calls
        .initiate_call(&alice.to_user(), call_request(&bob, Some("call-9")))
        .await
        .unwrap();
    state.calls.accept_call(&bob.to_user(), "call-9").await.unwrap();
    alice_session.dispatch(&join_frame("call-9")).await;
    bob_session.dispatch(&join_frame("call-9")).await;
    settle().await;
    assert_eq!(
        state.calls.get_call(&bob.to_user(), "call-9").await.unwrap().status,
        CallStatus::Active
    );
    drain(&mut bob_rx);

    // alice's socket is gone but her session was never closed
    drop(alice_rx);
    bob_session
        .dispatch(r#"{"event":"send_message","data":{"room_id":"call-9","message":"are you there?"}}"#)
        .await;
    settle().await;

    assert!(!state.registry.is_online(&alice.id).await);
    assert_eq!(state.relay.member_count("call-9").await, 1);
    assert!(names(&drain(&mut bob_rx)).contains(&"call_ended"));
    assert_eq!(
        state.calls.get_call(&bob.to_user(), "call-9").await.unwrap().status,
        CallStatus::Ended
    );
}

#[tokio::test]
async fn test_second_device_keeps_call_alive() {
    let state = test_state();
    let alice = TestUser::patient("alice@example.com");
    let bob = TestUser::doctor("bob@example.com");
    let (alice_phone, _phone_rx) = connect(&state, &alice).await;
    let (alice_laptop, _laptop_rx) = connect(&state, &alice).await;
    let (bob_session, _bob_rx) = connect(&state, &bob).await;

    state
        .calls
        .initiate_call(&alice.to_user(), call_request(&bob, Some("call-8")))
        .await
        .unwrap();
    state.calls.accept_call(&bob.to_user(), "call-8").await.unwrap();

    for session in [&alice_phone, &alice_laptop, &bob_session] {
        session.dispatch(&join_frame("call-8")).await;
    }
    alice_phone.dispatch(&leave_frame("call-8")).await;

    assert_eq!(
        state.calls.get_call(&bob.to_user(), "call-8").await.unwrap().status,
        CallStatus::Active
    );
}
