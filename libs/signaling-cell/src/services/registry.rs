use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_utils::jwt::validate_token;

use crate::error::{AuthFailure, SignalingError};
use crate::events::ServerMessage;
use crate::models::{ConnectionId, UserRole};

pub type EventSender = mpsc::UnboundedSender<ServerMessage>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerMessage>;

/// Credential sources offered by a connecting client.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub auth_token: Option<String>,
    pub query_token: Option<String>,
    pub bearer_token: Option<String>,
    pub user_type_hint: Option<String>,
}

impl Handshake {
    /// Auth field first, then query string, then `Authorization: Bearer`.
    pub fn credential(&self) -> Option<&str> {
        fn non_empty(value: &Option<String>) -> Option<&str> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
        }

        non_empty(&self.auth_token)
            .or_else(|| non_empty(&self.query_token))
            .or_else(|| non_empty(&self.bearer_token))
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: String,
    pub role: UserRole,
    pub rooms: HashSet<String>,
    pub connected_at: DateTime<Utc>,
    sender: EventSender,
}

impl Connection {
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedConnection {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub role: UserRole,
    pub connected_at: DateTime<Utc>,
    pub device_count: usize,
}

/// A registry entry that was torn down, with what the relay needs to clean up.
#[derive(Debug, Clone)]
pub struct RemovedConnection {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub rooms: Vec<String>,
    pub went_offline: bool,
}

#[derive(Debug, Clone)]
pub struct DisconnectOutcome {
    pub removed: RemovedConnection,
    pub swept: Vec<RemovedConnection>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    // user id -> that user's devices; doubles as the personal room for direct pushes
    personal_rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn remove(&mut self, connection_id: &ConnectionId) -> Option<RemovedConnection> {
        let connection = self.connections.remove(connection_id)?;

        let mut went_offline = true;
        if let Some(devices) = self.personal_rooms.get_mut(&connection.user_id) {
            devices.remove(connection_id);
            went_offline = devices.is_empty();
            if went_offline {
                self.personal_rooms.remove(&connection.user_id);
            }
        }

        Some(RemovedConnection {
            connection_id: connection.id,
            user_id: connection.user_id,
            rooms: connection.rooms.into_iter().collect(),
            went_offline,
        })
    }

    fn live_devices(&self, user_id: &str) -> usize {
        self.personal_rooms
            .get(user_id)
            .map(|devices| {
                devices
                    .iter()
                    .filter(|id| self.connections.get(id).is_some_and(Connection::is_alive))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Live socket connections per user.
pub struct ConnectionRegistry {
    config: Arc<AppConfig>,
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Verifies the handshake credential and registers the connection under
    /// the token subject. Nothing is registered when this fails.
    pub async fn authenticate(
        &self,
        handshake: &Handshake,
        sender: EventSender,
    ) -> Result<AuthenticatedConnection, SignalingError> {
        let token = handshake.credential().ok_or_else(|| {
            SignalingError::authentication(AuthFailure::MissingToken, "No credential provided")
        })?;

        if self.config.jwt_secret.is_empty() {
            warn!("Rejecting socket connection: JWT secret is not configured");
            return Err(SignalingError::authentication(
                AuthFailure::NotConfigured,
                "Authentication is not configured",
            ));
        }

        let user = validate_token(token, &self.config.jwt_secret).map_err(|e| {
            debug!("Socket credential rejected: {}", e);
            SignalingError::from(e)
        })?;

        let role = user
            .role
            .as_deref()
            .and_then(UserRole::parse)
            .or_else(|| handshake.user_type_hint.as_deref().and_then(UserRole::parse))
            .unwrap_or(UserRole::Patient);

        let connection = Connection {
            id: Uuid::new_v4(),
            user_id: user.id.clone(),
            role,
            rooms: HashSet::new(),
            connected_at: Utc::now(),
            sender,
        };

        let connection_id = connection.id;
        let connected_at = connection.connected_at;

        let device_count = {
            let mut inner = self.inner.write().await;
            inner
                .personal_rooms
                .entry(user.id.clone())
                .or_default()
                .insert(connection_id);
            inner.connections.insert(connection_id, connection);
            inner.live_devices(&user.id)
        };

        let authenticated = AuthenticatedConnection {
            connection_id,
            user_id: user.id,
            role,
            connected_at,
            device_count,
        };

        info!(
            "User {} connected as {} (connection {}, {} device(s))",
            authenticated.user_id,
            authenticated.role.as_str(),
            authenticated.connection_id,
            authenticated.device_count
        );

        Ok(authenticated)
    }

    /// Removes a connection, then prunes any other entry whose socket is gone.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<DisconnectOutcome> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.remove(&connection_id)
        }?;

        if removed.went_offline {
            info!("User {} is now offline", removed.user_id);
        } else {
            debug!("Connection {} of user {} closed", connection_id, removed.user_id);
        }

        let swept = self.sweep_stale().await;

        Some(DisconnectOutcome { removed, swept })
    }

    /// Drops entries whose outbound channel has been closed.
    pub async fn sweep_stale(&self) -> Vec<RemovedConnection> {
        let mut inner = self.inner.write().await;

        let stale: Vec<ConnectionId> = inner
            .connections
            .values()
            .filter(|connection| !connection.is_alive())
            .map(|connection| connection.id)
            .collect();

        let swept: Vec<RemovedConnection> = stale
            .iter()
            .filter_map(|connection_id| inner.remove(connection_id))
            .collect();

        if !swept.is_empty() {
            info!("Swept {} stale connection(s)", swept.len());
        }
        swept
    }

    /// Removes a single connection found dead while pushing to it.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<RemovedConnection> {
        let mut inner = self.inner.write().await;
        let removed = inner.remove(&connection_id);
        if removed.is_some() {
            warn!("Removed stale connection {}", connection_id);
        }
        removed
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.device_count(user_id).await > 0
    }

    pub async fn device_count(&self, user_id: &str) -> usize {
        self.inner.read().await.live_devices(user_id)
    }

    pub async fn connected_users(&self) -> HashSet<String> {
        let inner = self.inner.read().await;
        inner
            .personal_rooms
            .keys()
            .filter(|user_id| inner.live_devices(user_id) > 0)
            .cloned()
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn connection(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.inner.read().await.connections.get(&connection_id).cloned()
    }

    /// Every registered device of a user with its outbound channel.
    pub async fn user_senders(&self, user_id: &str) -> Vec<(ConnectionId, EventSender)> {
        let inner = self.inner.read().await;
        inner
            .personal_rooms
            .get(user_id)
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|id| inner.connections.get(id))
                    .map(|connection| (connection.id, connection.sender()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn senders(&self, connection_ids: &[ConnectionId]) -> Vec<(ConnectionId, Option<EventSender>)> {
        let inner = self.inner.read().await;
        connection_ids
            .iter()
            .map(|id| (*id, inner.connections.get(id).map(Connection::sender)))
            .collect()
    }

    pub async fn user_ids(&self, connection_ids: &[ConnectionId]) -> Vec<String> {
        let inner = self.inner.read().await;
        connection_ids
            .iter()
            .filter_map(|id| inner.connections.get(id))
            .map(|connection| connection.user_id.clone())
            .collect()
    }

    /// Mirrors relay membership on the connection so disconnect knows which rooms to leave.
    pub async fn track_room(&self, connection_id: ConnectionId, room_id: &str, joined: bool) {
        let mut inner = self.inner.write().await;
        if let Some(connection) = inner.connections.get_mut(&connection_id) {
            if joined {
                connection.rooms.insert(room_id.to_string());
            } else {
                connection.rooms.remove(room_id);
            }
        }
    }
}
