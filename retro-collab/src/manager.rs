//! Connection manager: the transport-independent side of a connection.
//!
//! The server hands each socket's text frames to [`ConnectionManager`] and
//! drains the connection's outbox back to the socket. Tests drive it
//! directly through channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use retro_core::Action;

use crate::broadcast::{ConnectionId, Outbox};
use crate::protocol::{ClientMessage, ProtocolError, RoomId};
use crate::registry::SessionRegistry;
use crate::session::{Dispatched, RoomSession, SessionError};

/// Attempts at attaching before giving up on a room that keeps closing.
const MAX_ATTACH_ATTEMPTS: usize = 3;

/// An open connection's membership in one room.
pub struct ConnectionHandle {
    id: ConnectionId,
    session: Arc<RoomSession>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn room(&self) -> &RoomId {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<RoomSession> {
        &self.session
    }
}

pub struct ConnectionManager {
    registry: Arc<SessionRegistry>,
    next_id: AtomicU64,
    rejected: AtomicU64,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            next_id: AtomicU64::new(1),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Actions and frames refused so far (malformed or rejected).
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Join `room` with a fresh connection id. The room's snapshot is the
    /// first frame queued on `outbox`.
    pub async fn open(&self, room: &RoomId, outbox: Outbox) -> Result<ConnectionHandle, SessionError> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        for attempt in 1..=MAX_ATTACH_ATTEMPTS {
            let session = self.registry.get_or_create(room).await?;
            match session.attach(id, outbox.clone()).await {
                Ok(()) => return Ok(ConnectionHandle { id, session }),
                Err(SessionError::RoomClosed(_)) => {
                    log::debug!("Room {room} closed under {id}, retrying ({attempt})");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::RoomClosed(room.clone()))
    }

    /// Decode and dispatch one text frame.
    ///
    /// Undecodable frames are answered with `malformedMessage` to this
    /// connection only and never reach the room.
    pub async fn receive(&self, handle: &ConnectionHandle, text: &str) -> Result<Dispatched, SessionError> {
        match ClientMessage::decode(text) {
            Ok(msg) => self.dispatch(handle, msg.into()).await,
            Err(e) => Err(self.reject(handle, e).await),
        }
    }

    pub async fn dispatch(&self, handle: &ConnectionHandle, action: Action) -> Result<Dispatched, SessionError> {
        let result = handle.session.dispatch(handle.id, action).await;
        if matches!(result, Err(SessionError::Rejected(_))) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Report a protocol error to the connection and hand it back as a [`SessionError`].
    pub async fn reject(&self, handle: &ConnectionHandle, error: ProtocolError) -> SessionError {
        log::warn!("{} in room {}: {error}", handle.id, handle.room());
        self.rejected.fetch_add(1, Ordering::Relaxed);
        handle.session.reply_error(handle.id, error.code(), &error).await;
        SessionError::Protocol(error)
    }

    /// Leave the room. Nothing the connection did is undone.
    pub async fn close(&self, handle: ConnectionHandle) {
        handle.session.detach(handle.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Frame;
    use crate::protocol::ServerMessage;
    use crate::registry::RegistryConfig;
    use crate::storage::MemoryStore;
    use retro_core::Phase;
    use tokio::sync::mpsc;

    fn manager() -> ConnectionManager {
        let registry = SessionRegistry::new(RegistryConfig::default(), Arc::new(MemoryStore::new()));
        ConnectionManager::new(Arc::new(registry))
    }

    fn next(rx: &mut mpsc::Receiver<Frame>) -> ServerMessage {
        ServerMessage::decode(&rx.try_recv().expect("expected a queued frame")).unwrap()
    }

    #[tokio::test]
    async fn test_open_assigns_unique_ids() {
        let m = manager();
        let room = RoomId::parse("r").unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let a = m.open(&room, tx.clone()).await.unwrap();
        let b = m.open(&room, tx).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.room(), &room);
        assert_eq!(a.session().connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_receive_decodes_and_dispatches() {
        let m = manager();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = m.open(&RoomId::parse("r").unwrap(), tx).await.unwrap();
        next(&mut rx);

        let outcome = m.receive(&handle, r#"{"type":"start"}"#).await.unwrap();
        assert_eq!(outcome, Dispatched::Applied { events: 1 });
        match next(&mut rx) {
            ServerMessage::Init(snap) => assert_eq!(snap.phase, Phase::Brainstorming),
            other => panic!("Expected init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_answered_to_sender_only() {
        let m = manager();
        let room = RoomId::parse("r").unwrap();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = m.open(&room, tx_a).await.unwrap();
        let _b = m.open(&room, tx_b).await.unwrap();
        next(&mut rx_a);
        next(&mut rx_b);

        let err = m.receive(&a, "{not json").await.unwrap_err();
        assert_eq!(err.code(), "malformedMessage");
        match next(&mut rx_a) {
            ServerMessage::Error { code, .. } => assert_eq!(code, "malformedMessage"),
            other => panic!("Expected error, got {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
        assert_eq!(m.rejected_count(), 1);
        assert_eq!(a.session().snapshot().await.phase, Phase::Joining);
    }

    #[tokio::test]
    async fn test_close_removes_membership() {
        let m = manager();
        let (tx, _rx) = mpsc::channel(8);
        let handle = m.open(&RoomId::parse("r").unwrap(), tx).await.unwrap();
        let session = handle.session().clone();
        m.close(handle).await;
        assert_eq!(session.connection_count().await, 0);
    }
}
