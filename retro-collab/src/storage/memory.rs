use std::collections::HashMap;
use std::sync::RwLock;

use retro_core::Room;

use super::{RoomStore, StoreError};
use crate::protocol::RoomId;

/// Records held in process memory. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<RoomId, Room>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rooms.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl RoomStore for MemoryStore {
    fn create(&self, id: &RoomId, room: &Room) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().map_err(poisoned)?;
        if rooms.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.clone()));
        }
        rooms.insert(id.clone(), room.clone());
        Ok(())
    }

    fn load(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.read().map_err(poisoned)?.get(id).cloned())
    }

    fn save(&self, id: &RoomId, room: &Room) -> Result<(), StoreError> {
        self.rooms
            .write()
            .map_err(poisoned)?
            .insert(id.clone(), room.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<RoomId>, StoreError> {
        let mut ids: Vec<RoomId> = self.rooms.read().map_err(poisoned)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
