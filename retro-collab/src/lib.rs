//! # retro-collab — Real-time session layer for retrospectives
//!
//! Serves retro rooms over WebSockets: every participant holds one
//! connection scoped to a room, actions are applied to the room one at a
//! time, and the resulting events fan out to everyone in the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ RetroClient │ ◄────────────────► │   RetroServer    │
//! │ (browser)   │     JSON frames    │ ConnectionManager│
//! └─────────────┘                    └────────┬─────────┘
//!                                             │
//!                                    ┌────────▼─────────┐
//!                                    │ SessionRegistry  │
//!                                    └────────┬─────────┘
//!                                             │ one per room
//!                                    ┌────────▼─────────┐      ┌───────────┐
//!                                    │   RoomSession    │ ───► │ RoomStore │
//!                                    │ RetroMachine     │      └───────────┘
//!                                    │ Fanout           │
//!                                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages and room ids
//! - [`broadcast`] — Per-room fan-out with bounded outboxes
//! - [`session`] — One live room, serialised under its own lock
//! - [`registry`] — Room lookup, creation, recovery and eviction
//! - [`manager`] — Connection open/receive/close, independent of transport
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client
//! - [`storage`] — Durable room records (memory or RocksDB)

pub mod broadcast;
pub mod client;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{
    local_fanout, BroadcastGroup, BroadcastStats, ConnectionId, Fanout, FanoutFactory, Frame,
    Outbox, PublishReport,
};
pub use client::{ClientEvent, ConnectionState, RetroClient};
pub use manager::{ConnectionHandle, ConnectionManager};
pub use protocol::{ClientMessage, ProtocolError, RoomId, ServerMessage, RETRO_PATH_PREFIX};
pub use registry::{
    EvictionPolicy, IdleTimeout, NeverEvict, RegistryConfig, RoomActivity, SessionRegistry,
};
pub use server::{RetroServer, ServerConfig, ServerStats};
pub use session::{ConnectionRecord, Dispatched, RoomSession, SessionError};
pub use storage::{
    MemoryStore, RocksStore, RoomMetadata, RoomStore, StoreConfig, StoreError,
};
