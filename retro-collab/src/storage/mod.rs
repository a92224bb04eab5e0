//! Durable room records.
//!
//! ```text
//! ┌──────────────┐  create / load / save  ┌──────────────┐
//! │ RoomSession  │ ─────────────────────► │  RoomStore   │
//! │ (live state) │                        ├──────────────┤
//! └──────────────┘                        │ MemoryStore  │  default
//!                                         │ RocksStore   │  CF "rooms" (LZ4 snapshots)
//!                                         │              │  CF "metadata"
//!                                         └──────────────┘
//! ```
//!
//! Sessions write a record on creation, after every accepted action except
//! topic drags, when the last connection leaves, and on eviction.

pub mod memory;
pub mod rocks;

use thiserror::Error;

use retro_core::Room;

use crate::protocol::RoomId;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, RoomMetadata, StoreConfig};

/// Create/read/update of room records keyed by room id.
pub trait RoomStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] if one is present.
    fn create(&self, id: &RoomId, room: &Room) -> Result<(), StoreError>;

    fn load(&self, id: &RoomId) -> Result<Option<Room>, StoreError>;

    /// Insert or overwrite.
    fn save(&self, id: &RoomId, room: &Room) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<RoomId>, StoreError>;

    fn exists(&self, id: &RoomId) -> Result<bool, StoreError> {
        Ok(self.load(id)?.is_some())
    }
}

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Room already exists: {0}")]
    AlreadyExists(RoomId),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
