//! # Signaling Cell
//!
//! Real-time presence and call signaling for patient-doctor calls. Clients
//! keep a WebSocket open to this cell; call lifecycle requests arrive over
//! HTTP and are relayed to the other party's live devices, or queued for
//! them when they are offline.
//!
//! ## Features
//!
//! - **Presence**: multi-device connection registry keyed by the token subject
//! - **Rooms**: per-call and per-chat membership with join/leave/typing/message relay
//! - **Call lifecycle**: ringing, accepted, active, declined, missed, ended
//! - **Offline delivery**: undeliverable events are queued for 24h
//! - **Ephemeral state**: Redis with an in-process fallback when Redis is down
//! - **RTC credentials**: signed join tokens for the media provider
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                  Signaling Cell                     |
//! +-----------------------------------------------------+
//! |  handlers.rs    |  HTTP endpoint handlers           |
//! |  router.rs      |  Route definitions                |
//! |  socket.rs      |  WebSocket sessions               |
//! |  events.rs      |  Wire events (client and server)  |
//! |  models.rs      |  Call records & DTOs              |
//! |  state.rs       |  Service wiring & maintenance     |
//! |  services/      |  Business logic layer             |
//! |    registry.rs  |  Connections & presence           |
//! |    relay.rs     |  Room membership & delivery       |
//! |    store.rs     |  Two-tier ephemeral state         |
//! |    calls.rs     |  Call state machine               |
//! |    token.rs     |  RTC join tokens                  |
//! +-----------------------------------------------------+
//! ```
//!
//! ## API Endpoints
//!
//! ### Public
//! - `GET /signaling/health` - Store tier and connection counts
//! - `GET /signaling/ws` - WebSocket (`?token=`, `Authorization: Bearer`, or an `authenticate` frame)
//!
//! ### Calls
//! - `POST /signaling/calls` - Start a call
//! - `GET /signaling/calls/{call_id}` - Current call status
//! - `POST /signaling/calls/{call_id}/accept` - Accept (callee)
//! - `POST /signaling/calls/{call_id}/decline` - Decline (callee)
//! - `POST /signaling/calls/{call_id}/end` - End (either party)
//!
//! ### Presence, rooms & notifications
//! - `GET /signaling/presence/{user_id}` - Online state and device count
//! - `GET /signaling/rooms/{room_id}/members` - Room summary
//! - `POST /signaling/rooms/{room_id}/messages` - Broadcast a chat message
//! - `GET /signaling/notifications?clear=true` - Queued offline events
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use signaling_cell::{router::signaling_routes, SignalingState};
//! use shared_config::AppConfig;
//!
//! let config = Arc::new(AppConfig::from_env());
//! let state = Arc::new(SignalingState::initialize(config).await);
//! let _maintenance = state.spawn_maintenance();
//! let app = axum::Router::new().nest("/signaling", signaling_routes(state));
//! ```

pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod socket;
pub mod state;

pub use error::{AuthFailure, SignalingError, StoreError};
pub use events::{ClientEvent, ServerEvent, ServerMessage};
pub use state::SignalingState;
