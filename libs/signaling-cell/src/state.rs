use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use shared_config::AppConfig;

use crate::services::registry::RemovedConnection;
use crate::services::{
    CallSignalingService, CallTokenIssuer, ConnectionRegistry, EphemeralStateStore,
    HmacCallTokenIssuer, RoomRelay,
};

/// Services shared by the socket sessions and the HTTP handlers. Built once
/// at startup and handed to the router.
pub struct SignalingState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub relay: Arc<RoomRelay>,
    pub store: Arc<EphemeralStateStore>,
    pub calls: CallSignalingService,
    release_listener: JoinHandle<()>,
}

impl SignalingState {
    /// Connects the store (Redis when reachable) and wires the services.
    pub async fn initialize(config: Arc<AppConfig>) -> Self {
        let store = EphemeralStateStore::connect(&config).await;
        let issuer = HmacCallTokenIssuer::from_config(&config);
        Self::with_components(config, store, Arc::new(issuer))
    }

    /// In-process store, used when no Redis is wanted.
    pub fn in_memory(config: Arc<AppConfig>) -> Self {
        let issuer = HmacCallTokenIssuer::from_config(&config);
        Self::with_components(config, EphemeralStateStore::in_memory(), Arc::new(issuer))
    }

    /// Must be called inside a Tokio runtime.
    pub fn with_components(
        config: Arc<AppConfig>,
        store: EphemeralStateStore,
        token_issuer: Arc<dyn CallTokenIssuer>,
    ) -> Self {
        let (released_tx, released_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(config.clone()));
        let relay = Arc::new(
            RoomRelay::new(registry.clone(), config.room_summary_delay()).with_release_channel(released_tx),
        );
        let store = Arc::new(store);
        let calls = CallSignalingService::new(&config, relay.clone(), store.clone(), token_issuer);
        let release_listener = spawn_release_listener(relay.clone(), calls.clone(), released_rx);

        Self {
            config,
            registry,
            relay,
            store,
            calls,
            release_listener,
        }
    }

    /// Cleans up after connections that went away: room membership first,
    /// then any live call they were part of.
    pub async fn release_connections(&self, removed: &[RemovedConnection]) {
        release(&self.relay, &self.calls, removed).await;
    }

    /// One maintenance tick: stale sweep, store health check, TTL purge.
    pub async fn run_maintenance(&self) {
        let swept = self.registry.sweep_stale().await;
        self.release_connections(&swept).await;

        let primary_up = self.store.check_health().await;
        let purged = self.store.purge_expired().await;

        debug!(
            "Maintenance: swept {} connection(s), purged {} key(s), store tier {} (primary up: {})",
            swept.len(),
            purged,
            self.store.tier(),
            primary_up
        );
    }

    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let period = state.config.cleanup_interval();
        info!("Signaling maintenance every {:?}", period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.run_maintenance().await;
            }
        })
    }
}

impl Drop for SignalingState {
    fn drop(&mut self) {
        self.release_listener.abort();
    }
}

async fn release(relay: &RoomRelay, calls: &CallSignalingService, removed: &[RemovedConnection]) {
    for connection in removed {
        relay.drop_connection(connection).await;
        for room_id in &connection.rooms {
            calls.on_room_left(room_id, &connection.user_id).await;
        }
    }
}

/// Releases connections the relay dropped after a failed push.
fn spawn_release_listener(
    relay: Arc<RoomRelay>,
    calls: CallSignalingService,
    mut released: mpsc::UnboundedReceiver<RemovedConnection>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(connection) = released.recv().await {
            debug!(
                "Releasing connection {} of user {} found dead on push",
                connection.connection_id, connection.user_id
            );
            release(&relay, &calls, std::slice::from_ref(&connection)).await;
        }
    })
}
