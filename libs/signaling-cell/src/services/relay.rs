use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::events::{ServerEvent, ServerMessage};
use crate::models::{CallStatusRecord, ConnectionId, RoomSummary};
use crate::services::registry::{ConnectionRegistry, RemovedConnection};

const MAX_ROOM_ID_LEN: usize = 128;

pub fn validate_room_id(room_id: &str) -> Result<(), SignalingError> {
    if room_id.trim().is_empty() {
        return Err(SignalingError::Validation("room_id is required".to_string()));
    }
    if room_id.len() > MAX_ROOM_ID_LEN {
        return Err(SignalingError::Validation(format!(
            "room_id must be at most {} characters",
            MAX_ROOM_ID_LEN
        )));
    }
    if !room_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
    {
        return Err(SignalingError::Validation(
            "room_id may only contain letters, digits, '-', '_', ':' and '.'".to_string(),
        ));
    }
    Ok(())
}

/// A call lifecycle event pushed to one participant.
#[derive(Debug, Clone)]
pub struct CallNotice {
    pub recipient: String,
    pub event: ServerEvent,
    pub devices: usize,
}

/// Room membership and event delivery between connections.
#[derive(Clone)]
pub struct RoomRelay {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RwLock<HashMap<String, HashSet<ConnectionId>>>>,
    summary_delay: Duration,
    released: Option<mpsc::UnboundedSender<RemovedConnection>>,
}

impl RoomRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, summary_delay: Duration) -> Self {
        Self {
            registry,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            summary_delay,
            released: None,
        }
    }

    /// Reports every connection found dead during a push on `released`, so
    /// the calls it took part in can be cleaned up.
    pub fn with_release_channel(mut self, released: mpsc::UnboundedSender<RemovedConnection>) -> Self {
        self.released = Some(released);
        self
    }

    /// Adds the connection to the room and returns the member count.
    ///
    /// The joiner gets `room_joined`, the existing members get `user_joined`,
    /// and once the settle delay has passed everyone gets a `room_update`
    /// computed at that moment, so concurrent joins are reported together.
    pub async fn join_room(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        user_id: &str,
    ) -> Result<usize, SignalingError> {
        validate_room_id(room_id)?;

        let connection = self
            .registry
            .connection(connection_id)
            .await
            .ok_or_else(|| SignalingError::NotFound(format!("connection {}", connection_id)))?;

        if connection.user_id != user_id {
            return Err(SignalingError::Authorization(format!(
                "connection {} does not belong to user {}",
                connection_id, user_id
            )));
        }

        let (newly_joined, member_count, existing) = {
            let mut rooms = self.rooms.write().await;
            let members = rooms.entry(room_id.to_string()).or_default();
            let newly_joined = members.insert(connection_id);
            let existing: Vec<ConnectionId> = members
                .iter()
                .copied()
                .filter(|id| *id != connection_id)
                .collect();
            (newly_joined, members.len(), existing)
        };

        self.registry.track_room(connection_id, room_id, true).await;

        connection.send(ServerMessage::in_room(
            ServerEvent::RoomJoined {
                room_id: room_id.to_string(),
                connection_id,
                member_count,
            },
            room_id,
            member_count,
        ));

        if !newly_joined {
            debug!("Connection {} already in room {}", connection_id, room_id);
            return Ok(member_count);
        }

        info!("User {} joined room {} ({} member(s))", user_id, room_id, member_count);

        self.push_to(
            &existing,
            ServerMessage::in_room(
                ServerEvent::UserJoined {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    connection_id,
                },
                room_id,
                member_count,
            ),
        )
        .await;

        self.schedule_room_update(room_id);

        Ok(member_count)
    }

    /// Removes the connection from the room. Returns `false` when it was not a member.
    pub async fn leave_room(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        user_id: &str,
    ) -> Result<bool, SignalingError> {
        validate_room_id(room_id)?;

        if let Some(connection) = self.registry.connection(connection_id).await {
            if connection.user_id != user_id {
                return Err(SignalingError::Authorization(format!(
                    "connection {} does not belong to user {}",
                    connection_id, user_id
                )));
            }
        }

        let Some(remaining) = self.detach(connection_id, room_id).await else {
            return Ok(false);
        };
        self.registry.track_room(connection_id, room_id, false).await;

        info!("User {} left room {} ({} member(s) remain)", user_id, room_id, remaining.len());
        self.push_to(&remaining, user_left(room_id, user_id, connection_id, remaining.len()))
            .await;

        Ok(true)
    }

    /// Leaves every room a torn-down connection was in.
    pub async fn drop_connection(&self, removed: &RemovedConnection) {
        for room_id in &removed.rooms {
            let Some(remaining) = self.detach(removed.connection_id, room_id).await else {
                continue;
            };
            info!(
                "User {} dropped from room {} ({} member(s) remain)",
                removed.user_id,
                room_id,
                remaining.len()
            );
            self.push_to(
                &remaining,
                user_left(room_id, &removed.user_id, removed.connection_id, remaining.len()),
            )
            .await;
        }
    }

    /// Removes the membership and returns the members left behind, or `None`
    /// when the connection was not in the room.
    async fn detach(&self, connection_id: ConnectionId, room_id: &str) -> Option<Vec<ConnectionId>> {
        let mut rooms = self.rooms.write().await;
        let members = rooms.get_mut(room_id)?;
        if !members.remove(&connection_id) {
            return None;
        }
        let remaining: Vec<ConnectionId> = members.iter().copied().collect();
        if remaining.is_empty() {
            rooms.remove(room_id);
        }
        Some(remaining)
    }

    /// Pushes to every live device of a user. Returns how many devices got it;
    /// zero means the caller should queue the event.
    pub async fn send_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let senders = self.registry.user_senders(user_id).await;
        let message = ServerMessage::direct(event);

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (connection_id, sender) in senders {
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                stale.push(connection_id);
            }
        }

        self.heal(stale).await;

        debug!("Sent {} to user {} on {} device(s)", message.event.name(), user_id, delivered);
        delivered
    }

    /// Broadcasts to the room's members, optionally skipping one connection.
    pub async fn send_to_room(
        &self,
        room_id: &str,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let members = self.members(room_id).await;
        let message = ServerMessage::in_room(event, room_id, members.len());

        let targets: Vec<ConnectionId> = members
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .collect();

        self.push_to(&targets, message).await
    }

    pub async fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        self.rooms.read().await.get(room_id).map(HashSet::len).unwrap_or(0)
    }

    pub async fn is_member(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_summary(&self, room_id: &str) -> RoomSummary {
        let members = self.members(room_id).await;
        let unique_users: BTreeSet<String> =
            self.registry.user_ids(&members).await.into_iter().collect();

        RoomSummary {
            room_id: room_id.to_string(),
            member_count: members.len(),
            unique_users: unique_users.into_iter().collect(),
        }
    }

    // ==========================================================================
    // CALL LIFECYCLE
    // ==========================================================================

    pub async fn notify_incoming_call(&self, record: &CallStatusRecord) -> CallNotice {
        self.notify(&record.metadata.callee_id, ServerEvent::incoming_call(record))
            .await
    }

    pub async fn notify_call_accepted(&self, record: &CallStatusRecord, actor_id: &str) -> CallNotice {
        self.notify(
            &record.metadata.caller_id,
            ServerEvent::CallAccepted {
                call_id: record.call_id.clone(),
                actor_id: actor_id.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await
    }

    pub async fn notify_call_declined(
        &self,
        record: &CallStatusRecord,
        actor_id: &str,
        reason: Option<String>,
    ) -> CallNotice {
        self.notify(
            &record.metadata.caller_id,
            ServerEvent::CallDeclined {
                call_id: record.call_id.clone(),
                actor_id: actor_id.to_string(),
                reason,
                timestamp: Utc::now(),
            },
        )
        .await
    }

    /// Tells the participant who did not end the call. `None` when the actor
    /// is not a participant.
    pub async fn notify_call_ended(
        &self,
        record: &CallStatusRecord,
        actor_id: &str,
        reason: Option<String>,
    ) -> Option<CallNotice> {
        let recipient = record.other_party(actor_id)?;
        let notice = self
            .notify(
                recipient,
                ServerEvent::CallEnded {
                    call_id: record.call_id.clone(),
                    actor_id: actor_id.to_string(),
                    reason,
                    timestamp: Utc::now(),
                },
            )
            .await;
        Some(notice)
    }

    async fn notify(&self, recipient: &str, event: ServerEvent) -> CallNotice {
        let devices = self.send_to_user(recipient, event.clone()).await;
        CallNotice {
            recipient: recipient.to_string(),
            event,
            devices,
        }
    }

    // ==========================================================================
    // INTERNALS
    // ==========================================================================

    async fn push_to(&self, targets: &[ConnectionId], message: ServerMessage) -> usize {
        let (delivered, stale) = self.deliver(targets, message).await;
        self.heal(stale).await;
        delivered
    }

    async fn deliver(
        &self,
        targets: &[ConnectionId],
        message: ServerMessage,
    ) -> (usize, Vec<ConnectionId>) {
        if targets.is_empty() {
            return (0, Vec::new());
        }

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (connection_id, sender) in self.registry.senders(targets).await {
            match sender {
                Some(sender) if sender.send(message.clone()).is_ok() => delivered += 1,
                _ => stale.push(connection_id),
            }
        }
        (delivered, stale)
    }

    /// Forgets connections whose socket is gone instead of failing the push.
    /// Room peers hear `user_left` right away; call cleanup happens wherever
    /// the release channel leads.
    async fn heal(&self, stale: Vec<ConnectionId>) {
        for connection_id in stale {
            let Some(removed) = self.registry.remove(connection_id).await else {
                let mut rooms = self.rooms.write().await;
                for members in rooms.values_mut() {
                    members.remove(&connection_id);
                }
                rooms.retain(|_, members| !members.is_empty());
                warn!("Dropped dangling room membership for connection {}", connection_id);
                continue;
            };

            // one level only: peers that turn out dead here are left to the sweep
            for room_id in &removed.rooms {
                if let Some(remaining) = self.detach(connection_id, room_id).await {
                    self.deliver(
                        &remaining,
                        user_left(room_id, &removed.user_id, connection_id, remaining.len()),
                    )
                    .await;
                }
            }

            if let Some(released) = &self.released {
                if released.send(removed).is_err() {
                    debug!("No listener for released connection {}", connection_id);
                }
            }
        }
    }

    fn schedule_room_update(&self, room_id: &str) {
        let relay = self.clone();
        let room_id = room_id.to_string();
        let delay = self.summary_delay;

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            relay.broadcast_room_update(&room_id).await;
        });
    }

    async fn broadcast_room_update(&self, room_id: &str) -> usize {
        let summary = self.room_summary(room_id).await;
        if summary.member_count == 0 {
            return 0;
        }

        self.send_to_room(
            room_id,
            ServerEvent::RoomUpdate {
                room_id: room_id.to_string(),
                member_count: summary.member_count,
                unique_users: summary.unique_users.len(),
            },
            None,
        )
        .await
    }
}

fn user_left(room_id: &str, user_id: &str, connection_id: ConnectionId, remaining: usize) -> ServerMessage {
    ServerMessage::in_room(
        ServerEvent::UserLeft {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            connection_id,
        },
        room_id,
        remaining,
    )
}
