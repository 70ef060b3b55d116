pub mod calls;
pub mod memory_backend;
pub mod redis_backend;
pub mod registry;
pub mod relay;
pub mod store;
pub mod token;

pub use calls::CallSignalingService;
pub use memory_backend::MemoryBackend;
pub use redis_backend::RedisBackend;
pub use registry::{ConnectionRegistry, EventReceiver, EventSender, Handshake};
pub use relay::{CallNotice, RoomRelay};
pub use store::{EphemeralStateStore, StateBackend, StoreHealth};
pub use token::{CallTokenIssuer, HmacCallTokenIssuer};
