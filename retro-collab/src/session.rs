//! One live room: its state machine, its connections, and its fan-out.
//!
//! ```text
//!   conn A ─┐                    ┌──────────── RoomSession ────────────┐
//!   conn B ─┼── dispatch(action) │ Mutex<SessionState>                 │
//!   conn C ─┘                    │   RetroMachine  ── apply ──► emits  │
//!                                │   Fanout        ◄─ publish/send_to  │
//!                                │   connections (identity per conn)   │
//!                                └──────────────┬──────────────────────┘
//!                                               ▼
//!                                           RoomStore
//! ```
//!
//! Everything that touches a room happens under its mutex: attaching a
//! connection and sending it the initial snapshot, applying an action, and
//! queueing the resulting frames. Fan-out never awaits, so the lock is held
//! only for the mutation plus a handful of `try_send`s. That single critical
//! section gives the room its total order. A connection attached between two
//! actions sees the snapshot and then exactly the events ordered after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Mutex;

use retro_core::{Action, Audience, RetroError, RetroMachine, Room, RoomSnapshot};

use crate::broadcast::{ConnectionId, Fanout, Frame, Outbox};
use crate::protocol::{ProtocolError, RoomId, ServerMessage};
use crate::registry::{EvictionPolicy, RoomActivity};
use crate::storage::{RoomStore, StoreError};

/// Per-connection state inside a room.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Set once, by the first accepted `join` on this connection.
    pub identity: Option<String>,
    pub opened_at: Instant,
}

impl ConnectionRecord {
    fn new() -> Self {
        Self {
            identity: None,
            opened_at: Instant::now(),
        }
    }
}

/// Outcome of a dispatched action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Applied; `events` frames were queued.
    Applied { events: usize },
    /// Not valid in the current phase. Nothing changed and nothing was sent.
    Ignored,
}

struct SessionState {
    machine: RetroMachine,
    fanout: Box<dyn Fanout>,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    last_activity: Instant,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Drop connections the fan-out gave up on. Returns `true` when this
    /// empties the room.
    fn forget(&mut self, dropped: &[ConnectionId]) -> bool {
        let mut removed = false;
        for conn in dropped {
            removed |= self.connections.remove(conn).is_some();
        }
        removed && self.connections.is_empty()
    }
}

pub struct RoomSession {
    id: RoomId,
    state: Mutex<SessionState>,
    /// Set under the state lock once the room has been saved for eviction.
    closed: AtomicBool,
    store: Arc<dyn RoomStore>,
}

impl RoomSession {
    pub fn new(
        id: RoomId,
        machine: RetroMachine,
        fanout: Box<dyn Fanout>,
        store: Arc<dyn RoomStore>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                machine,
                fanout,
                connections: HashMap::new(),
                last_activity: Instant::now(),
            }),
            closed: AtomicBool::new(false),
            store,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a connection and queue the current snapshot to it alone.
    pub async fn attach(&self, conn: ConnectionId, outbox: Outbox) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(SessionError::RoomClosed(self.id.clone()));
        }

        let init = encode(ServerMessage::Init(state.machine.snapshot()))?;
        state.fanout.register(conn, outbox);
        state.connections.insert(conn, ConnectionRecord::new());
        state.touch();

        if !state.fanout.send_to(conn, init) {
            state.connections.remove(&conn);
            log::warn!("{conn} went away before receiving room {}", self.id);
        } else {
            log::info!(
                "{conn} attached to room {} ({} connected)",
                self.id,
                state.connections.len()
            );
        }
        Ok(())
    }

    /// Remove a connection. Returns `false` if it was not attached.
    ///
    /// The person it joined as stays in the room.
    pub async fn detach(&self, conn: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        state.fanout.unregister(conn);
        let was_attached = state.connections.remove(&conn).is_some();
        state.touch();

        if was_attached {
            log::info!(
                "{conn} detached from room {} ({} connected)",
                self.id,
                state.connections.len()
            );
            if state.connections.is_empty() && !self.is_closed() {
                self.persist(state.machine.room());
            }
        }
        was_attached
    }

    /// Apply one action from `conn` and fan out what it emits.
    ///
    /// Rejections other than wrong-phase actions are reported to `conn`
    /// alone as an `error` frame and returned as [`SessionError::Rejected`].
    pub async fn dispatch(&self, conn: ConnectionId, action: Action) -> Result<Dispatched, SessionError> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(SessionError::RoomClosed(self.id.clone()));
        }
        let identity = match state.connections.get(&conn) {
            Some(record) => record.identity.clone(),
            None => return Err(SessionError::NotAttached(conn, self.id.clone())),
        };

        let kind = action.name();
        let ephemeral = action.is_ephemeral();
        let joined_as = match &action {
            Action::Join { name } => Some(name.clone()),
            _ => None,
        };

        let emits = match state.machine.apply(identity.as_deref(), action) {
            Ok(emits) => emits,
            Err(e) if e.is_silent() => {
                log::debug!("{conn} in room {}: ignoring {e}", self.id);
                return Ok(Dispatched::Ignored);
            }
            Err(e) => {
                log::warn!("{conn} in room {}: rejected {kind}: {e}", self.id);
                if Self::send_error(&mut state, conn, e.code(), &e) {
                    self.persist(state.machine.room());
                }
                return Err(SessionError::Rejected(e));
            }
        };

        if let (Some(name), Some(record)) = (joined_as, state.connections.get_mut(&conn)) {
            record.identity.get_or_insert(name);
        }

        if ephemeral {
            log::trace!("{conn} in room {}: {kind}", self.id);
        } else {
            log::debug!("{conn} in room {}: {kind}", self.id);
        }

        let mut queued = 0;
        let mut emptied = false;
        for emit in emits {
            let frame = encode(ServerMessage::from(emit.event))?;
            match emit.audience {
                Audience::Room => {
                    let report = state.fanout.publish(frame);
                    emptied |= state.forget(&report.dropped);
                }
                Audience::Origin => {
                    if !state.fanout.send_to(conn, frame) {
                        emptied |= state.forget(&[conn]);
                    }
                }
            }
            queued += 1;
        }
        state.touch();

        if !ephemeral || emptied {
            self.persist(state.machine.room());
        }
        Ok(Dispatched::Applied { events: queued })
    }

    /// Send an `error` frame to one connection of this room.
    pub async fn reply_error(&self, conn: ConnectionId, code: &str, message: impl std::fmt::Display) {
        let mut state = self.state.lock().await;
        if Self::send_error(&mut state, conn, code, message) && !self.is_closed() {
            self.persist(state.machine.room());
        }
    }

    /// Save and close the room if `policy` says it should go.
    ///
    /// Returns `true` once the room is closed. A closed room refuses
    /// attaches with [`SessionError::RoomClosed`].
    pub async fn try_close(&self, policy: &dyn EvictionPolicy) -> Result<bool, SessionError> {
        let state = self.state.lock().await;
        if self.is_closed() {
            return Ok(true);
        }
        let activity = Self::activity_of(&state);
        if !policy.should_evict(&activity) {
            return Ok(false);
        }
        self.store.save(&self.id, state.machine.room())?;
        self.closed.store(true, Ordering::Release);
        log::info!("Room {} closed after {:?} idle", self.id, activity.idle_for);
        Ok(true)
    }

    pub async fn activity(&self) -> RoomActivity {
        Self::activity_of(&*self.state.lock().await)
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        self.state.lock().await.machine.snapshot()
    }

    /// A copy of the room aggregate.
    pub async fn room(&self) -> Room {
        self.state.lock().await.machine.room().clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn identity_of(&self, conn: ConnectionId) -> Option<String> {
        self.state
            .lock()
            .await
            .connections
            .get(&conn)
            .and_then(|r| r.identity.clone())
    }

    fn activity_of(state: &SessionState) -> RoomActivity {
        RoomActivity {
            connections: state.connections.len(),
            idle_for: state.last_activity.elapsed(),
            phase: state.machine.phase(),
        }
    }

    /// Returns `true` when the reply could not be queued and dropping
    /// `conn` emptied the room.
    fn send_error(state: &mut SessionState, conn: ConnectionId, code: &str, message: impl std::fmt::Display) -> bool {
        match encode(ServerMessage::error(code, message)) {
            Ok(frame) => !state.fanout.send_to(conn, frame) && state.forget(&[conn]),
            Err(e) => {
                log::error!("Failed to encode error reply for {conn}: {e}");
                false
            }
        }
    }

    fn persist(&self, room: &Room) {
        if let Err(e) = self.store.save(&self.id, room) {
            log::error!("Failed to persist room {}: {e}", self.id);
        }
    }
}

fn encode(msg: ServerMessage) -> Result<Frame, ProtocolError> {
    Ok(Frame::from(msg.encode()?))
}

/// Errors surfaced by sessions, the registry and the connection manager.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unknown room: {0}")]
    UnknownRoom(RoomId),
    #[error("Room {0} is closed")]
    RoomClosed(RoomId),
    #[error("{0} is not attached to room {1}")]
    NotAttached(ConnectionId, RoomId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Action rejected: {0}")]
    Rejected(#[from] RetroError),
}

impl SessionError {
    /// Wire code sent in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::UnknownRoom(_) => "unknownRoom",
            SessionError::RoomClosed(_) => "roomClosed",
            SessionError::NotAttached(..) => "notAttached",
            SessionError::Protocol(e) => e.code(),
            SessionError::Store(_) => "storageError",
            SessionError::Rejected(e) => e.code(),
        }
    }
}
