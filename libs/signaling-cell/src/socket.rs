//! WebSocket entry point: one task per socket, plus a pusher task draining
//! the connection's outbound channel.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use axum_extra::typed_header::TypedHeaderRejection;
use axum_extra::TypedHeader;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::events::{ClientEvent, ServerEvent, ServerMessage};
use crate::models::ConnectionId;
use crate::services::registry::{AuthenticatedConnection, EventReceiver, EventSender, Handshake};
use crate::state::SignalingState;

const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Default, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
    #[serde(rename = "userType")]
    pub user_type: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SignalingState>>,
    Query(query): Query<SocketQuery>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
) -> impl IntoResponse {
    let handshake = Handshake {
        auth_token: None,
        query_token: query.token,
        bearer_token: bearer.ok().map(|TypedHeader(auth)| auth.token().to_string()),
        user_type_hint: query.user_type,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, handshake))
}

async fn handle_socket(socket: WebSocket, state: Arc<SignalingState>, mut handshake: Handshake) {
    let (mut sink, mut stream) = socket.split();

    if handshake.credential().is_none() {
        handshake.auth_token = await_auth_frame(&mut stream, state.config.socket_auth_timeout()).await;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let session = match SocketSession::open(state, &handshake, tx).await {
        Ok(session) => session,
        Err(e) => {
            info!("Socket rejected: {}", e);
            reject(&mut sink, &e).await;
            return;
        }
    };

    let mut pusher = pusher_loop(rx, sink);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => session.dispatch(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket {} read error: {}", session.connection_id(), e);
                    break;
                }
            },
            _ = &mut pusher => break,
        }
    }

    session.close().await;
    pusher.abort();
}

/// Waits for `{"event":"authenticate","data":{"token":..}}` as the first frame.
async fn await_auth_frame(stream: &mut SplitStream<WebSocket>, wait: Duration) -> Option<String> {
    let first_frame = async {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    return match ClientEvent::parse(text.as_str()) {
                        Ok(ClientEvent::Authenticate { token }) => Some(token),
                        _ => None,
                    };
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    };

    match tokio::time::timeout(wait, first_frame).await {
        Ok(token) => token,
        Err(_) => {
            debug!("No credential received within {:?}", wait);
            None
        }
    }
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, error: &SignalingError) {
    let event = ServerMessage::direct(ServerEvent::ConnectionError {
        code: error.code().to_string(),
        message: error.to_string(),
    });

    if let Ok(json) = event.to_json() {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static(error.code()),
        })))
        .await;
}

fn pusher_loop(mut rx: EventReceiver, mut sink: SplitSink<WebSocket, Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Dropping unserializable {} event: {}", message.event.name(), e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    })
}

/// An authenticated socket, independent of the transport so it can be driven
/// directly.
pub struct SocketSession {
    state: Arc<SignalingState>,
    connection: AuthenticatedConnection,
    sender: EventSender,
}

impl SocketSession {
    /// Registers the connection and greets it with `connected`.
    pub async fn open(
        state: Arc<SignalingState>,
        handshake: &Handshake,
        sender: EventSender,
    ) -> Result<Self, SignalingError> {
        let connection = state.registry.authenticate(handshake, sender.clone()).await?;
        let pending = state
            .store
            .get_queued_notifications(&connection.user_id)
            .await
            .len();

        let session = Self {
            state,
            connection,
            sender,
        };

        session.reply(ServerEvent::Connected {
            connection_id: session.connection.connection_id,
            user_id: session.connection.user_id.clone(),
            role: session.connection.role,
            device_count: session.connection.device_count,
            pending_notifications: pending,
            timestamp: Utc::now(),
        });

        Ok(session)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.connection.user_id
    }

    /// Handles one text frame. Failures are answered with an `error` event
    /// and never close the socket.
    pub async fn dispatch(&self, text: &str) {
        let result = match ClientEvent::parse(text) {
            Ok(event) => self.handle(event).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            debug!("Socket {} event failed: {}", self.connection_id(), e);
            self.reply(ServerEvent::error(&e));
        }
    }

    pub async fn handle(&self, event: ClientEvent) -> Result<(), SignalingError> {
        match event {
            ClientEvent::JoinRoom { room_id, user_id } => {
                let user_id = user_id.as_deref().unwrap_or(self.user_id());
                self.state
                    .relay
                    .join_room(self.connection_id(), &room_id, user_id)
                    .await?;
                self.state.calls.on_room_joined(&room_id).await;
            }
            ClientEvent::LeaveRoom { room_id, user_id } => {
                let user_id = user_id.as_deref().unwrap_or(self.user_id());
                let left = self
                    .state
                    .relay
                    .leave_room(self.connection_id(), &room_id, user_id)
                    .await?;
                if left {
                    self.state.calls.on_room_left(&room_id, self.user_id()).await;
                }
            }
            ClientEvent::TypingStart { room_id } => self.typing(&room_id, true).await?,
            ClientEvent::TypingStop { room_id } => self.typing(&room_id, false).await?,
            ClientEvent::SendMessage {
                room_id,
                message,
                message_type,
            } => {
                self.ensure_member(&room_id).await?;
                let event = new_message(&room_id, self.user_id(), &message, message_type)?;
                self.state.relay.send_to_room(&room_id, event, None).await;
            }
            ClientEvent::GetRoomMembers { room_id } => {
                self.ensure_member(&room_id).await?;
                let summary = self.state.relay.room_summary(&room_id).await;
                self.reply(ServerEvent::RoomMembers {
                    room_id: summary.room_id,
                    member_count: summary.member_count,
                    users: summary.unique_users,
                });
            }
            ClientEvent::Ping { .. } => self.reply(ServerEvent::Pong { timestamp: Utc::now() }),
            ClientEvent::Authenticate { .. } => {
                debug!("Connection {} is already authenticated", self.connection_id());
            }
        }
        Ok(())
    }

    /// Unregisters the connection and leaves its rooms.
    pub async fn close(self) {
        let Some(outcome) = self.state.registry.disconnect(self.connection_id()).await else {
            return;
        };

        let mut released = vec![outcome.removed];
        released.extend(outcome.swept);
        self.state.release_connections(&released).await;
    }

    async fn typing(&self, room_id: &str, is_typing: bool) -> Result<(), SignalingError> {
        self.ensure_member(room_id).await?;
        self.state
            .relay
            .send_to_room(
                room_id,
                ServerEvent::UserTyping {
                    room_id: room_id.to_string(),
                    user_id: self.user_id().to_string(),
                    is_typing,
                },
                Some(self.connection_id()),
            )
            .await;
        Ok(())
    }

    async fn ensure_member(&self, room_id: &str) -> Result<(), SignalingError> {
        if self.state.relay.is_member(room_id, self.connection_id()).await {
            Ok(())
        } else {
            Err(SignalingError::Authorization(format!("Not a member of room {}", room_id)))
        }
    }

    fn reply(&self, event: ServerEvent) {
        if self.sender.send(ServerMessage::direct(event)).is_err() {
            debug!("Socket {} is gone, reply dropped", self.connection_id());
        }
    }
}

/// Builds a `new_message` event, validating the body.
pub fn new_message(
    room_id: &str,
    sender_id: &str,
    message: &str,
    message_type: Option<String>,
) -> Result<ServerEvent, SignalingError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(SignalingError::Validation("message must not be empty".to_string()));
    }
    if message.chars().count() > MAX_MESSAGE_LEN {
        return Err(SignalingError::Validation(format!(
            "message must be at most {} characters",
            MAX_MESSAGE_LEN
        )));
    }

    Ok(ServerEvent::NewMessage {
        message_id: uuid::Uuid::new_v4(),
        room_id: room_id.to_string(),
        sender_id: sender_id.to_string(),
        message: message.to_string(),
        message_type: message_type.unwrap_or_else(|| "text".to_string()),
        timestamp: Utc::now(),
    })
}
