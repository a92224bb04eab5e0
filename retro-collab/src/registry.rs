//! Session registry: room id → live [`RoomSession`].
//!
//! Lookups take the read lock; creation takes the write lock and checks
//! again, so concurrent first references to one room build exactly one
//! session. Different rooms never share a lock once their sessions exist.
//!
//! Rooms live until the [`EvictionPolicy`] lets them go. The default policy
//! keeps every room for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use retro_core::{Phase, RetroMachine, RetroRules, Room, Workspace};

use crate::broadcast::{local_fanout, FanoutFactory};
use crate::protocol::RoomId;
use crate::session::{RoomSession, SessionError};
use crate::storage::{RoomStore, StoreError};

// ───────────────────────────────────────────────────────────────────
// Eviction
// ───────────────────────────────────────────────────────────────────

/// What an eviction policy gets to see about a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomActivity {
    pub connections: usize,
    /// Time since the last attach, detach or accepted action.
    pub idle_for: Duration,
    pub phase: Phase,
}

/// Decides when a live room may be dropped from memory.
///
/// Evicted rooms are saved first and reload from the store on next use.
pub trait EvictionPolicy: Send + Sync {
    fn should_evict(&self, activity: &RoomActivity) -> bool;
}

/// Keep every room for the life of the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEvict;

impl EvictionPolicy for NeverEvict {
    fn should_evict(&self, _activity: &RoomActivity) -> bool {
        false
    }
}

/// Evict rooms nobody is connected to once they have been idle this long.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout(pub Duration);

impl EvictionPolicy for IdleTimeout {
    fn should_evict(&self, activity: &RoomActivity) -> bool {
        activity.connections == 0 && activity.idle_for >= self.0
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub rules: RetroRules,
    pub workspace: Workspace,
    /// Create rooms on first reference. When off, only rooms with a stored
    /// record can be opened.
    pub auto_create_rooms: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rules: RetroRules::default(),
            workspace: Workspace::default(),
            auto_create_rooms: true,
        }
    }
}

pub struct SessionRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomSession>>>,
    store: Arc<dyn RoomStore>,
    eviction: Arc<dyn EvictionPolicy>,
    fanout: FanoutFactory,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, store: Arc<dyn RoomStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            eviction: Arc::new(NeverEvict),
            fanout: local_fanout(),
            config,
        }
    }

    pub fn with_eviction(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = policy;
        self
    }

    pub fn with_fanout(mut self, factory: FanoutFactory) -> Self {
        self.fanout = factory;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Return the live session for `id`, loading or creating it if needed.
    pub async fn get_or_create(&self, id: &RoomId) -> Result<Arc<RoomSession>, SessionError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(session) = rooms.get(id) {
                if !session.is_closed() {
                    return Ok(session.clone());
                }
            }
        }

        // Slow path: write lock, double-check
        let mut rooms = self.rooms.write().await;
        if let Some(session) = rooms.get(id) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }

        let room = match self.store.load(id)? {
            Some(room) => {
                log::info!("Loaded room {id} from storage ({})", room.phase);
                room
            }
            None if self.config.auto_create_rooms => {
                let room = Room::new();
                match self.store.create(id, &room) {
                    Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                log::info!("Created room {id}");
                room
            }
            None => return Err(SessionError::UnknownRoom(id.clone())),
        };

        let session = Arc::new(self.build_session(id, room));
        rooms.insert(id.clone(), session.clone());
        Ok(session)
    }

    /// The live session for `id`, if it is in memory.
    pub async fn get(&self, id: &RoomId) -> Option<Arc<RoomSession>> {
        self.rooms
            .read()
            .await
            .get(id)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Mint a fresh room id and store an empty record for it.
    pub async fn create_room(&self) -> Result<RoomId, SessionError> {
        let id = RoomId::generate();
        self.store.create(&id, &Room::new())?;
        log::info!("Created room record {id}");
        Ok(id)
    }

    /// Load every stored room that is not already live. Returns how many were loaded.
    pub async fn recover(&self) -> Result<usize, SessionError> {
        let ids = self.store.list()?;
        let mut rooms = self.rooms.write().await;
        let mut recovered = 0;

        for id in &ids {
            if rooms.contains_key(id) {
                continue;
            }
            match self.store.load(id) {
                Ok(Some(room)) => {
                    rooms.insert(id.clone(), Arc::new(self.build_session(id, room)));
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) => log::error!("Failed to recover room {id}: {e}"),
            }
        }

        log::info!("Recovery complete: {recovered}/{} rooms restored", ids.len());
        Ok(recovered)
    }

    /// Close and drop every room the eviction policy selects.
    pub async fn evict_idle(&self) -> Vec<RoomId> {
        let candidates: Vec<Arc<RoomSession>> = self.rooms.read().await.values().cloned().collect();
        let mut evicted = Vec::new();

        for session in candidates {
            match session.try_close(self.eviction.as_ref()).await {
                Ok(true) => {
                    let mut rooms = self.rooms.write().await;
                    let current = rooms.get(session.id()).is_some_and(|s| Arc::ptr_eq(s, &session));
                    if current {
                        rooms.remove(session.id());
                    }
                    log::info!("Evicted room {}", session.id());
                    evicted.push(session.id().clone());
                }
                Ok(false) => {}
                Err(e) => log::error!("Failed to evict room {}: {e}", session.id()),
            }
        }
        evicted
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of rooms currently in memory, sorted.
    pub async fn active_rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn build_session(&self, id: &RoomId, room: Room) -> RoomSession {
        let machine = RetroMachine::from_room(room, self.config.rules, self.config.workspace);
        RoomSession::new(id.clone(), machine, (self.fanout)(id), self.store.clone())
    }
}
