//! Per-room fan-out of encoded frames to connection outboxes.
//!
//! Every connection owns a bounded outbox (`mpsc::Sender<Frame>`) drained by
//! its socket writer. A frame is encoded once and shared as `Arc<str>`.
//!
//! Fan-out never awaits: `try_send` either queues the frame or the member is
//! dropped. A connection that cannot keep up loses its membership and its
//! outbox is closed, so it is disconnected instead of silently missing events.
//!
//! [`Fanout`] is the seam for substituting a networked broker. The in-process
//! [`BroadcastGroup`] is the default and does not span processes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::RoomId;

/// One encoded server message.
pub type Frame = Arc<str>;

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Frame>;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub members_dropped: u64,
    pub active_members: usize,
}

/// Result of publishing one frame to a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Members removed because their outbox was full or closed.
    pub dropped: Vec<ConnectionId>,
}

/// Group membership and delivery for one room.
///
/// Callers hold the room's lock for every call, so implementations see a
/// single writer and must deliver frames in call order.
pub trait Fanout: Send {
    fn register(&mut self, conn: ConnectionId, outbox: Outbox);

    /// Returns `false` if the connection was not a member.
    fn unregister(&mut self, conn: ConnectionId) -> bool;

    /// Deliver to every member.
    fn publish(&mut self, frame: Frame) -> PublishReport;

    /// Deliver to one member. Returns `false` if it is gone or was dropped.
    fn send_to(&mut self, conn: ConnectionId, frame: Frame) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> BroadcastStats;
}

/// Builds the fan-out for a newly created room.
pub type FanoutFactory = Arc<dyn Fn(&RoomId) -> Box<dyn Fanout> + Send + Sync>;

/// Factory for the in-process [`BroadcastGroup`].
pub fn local_fanout() -> FanoutFactory {
    Arc::new(|_room: &RoomId| Box::new(BroadcastGroup::new()) as Box<dyn Fanout>)
}

/// In-process broadcast group for a single room.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    /// Ordered by connection id so delivery order is deterministic.
    members: BTreeMap<ConnectionId, Outbox>,
    messages_sent: u64,
    members_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.members.contains_key(&conn)
    }

    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.keys().copied().collect()
    }

    fn deliver(outbox: &Outbox, conn: ConnectionId, frame: Frame) -> bool {
        match outbox.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("{conn} outbox full; dropping slow consumer");
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("{conn} outbox closed");
                false
            }
        }
    }
}

impl Fanout for BroadcastGroup {
    fn register(&mut self, conn: ConnectionId, outbox: Outbox) {
        self.members.insert(conn, outbox);
    }

    fn unregister(&mut self, conn: ConnectionId) -> bool {
        self.members.remove(&conn).is_some()
    }

    fn publish(&mut self, frame: Frame) -> PublishReport {
        let mut report = PublishReport::default();
        for (conn, outbox) in &self.members {
            if Self::deliver(outbox, *conn, frame.clone()) {
                report.delivered += 1;
            } else {
                report.dropped.push(*conn);
            }
        }
        for conn in &report.dropped {
            self.members.remove(conn);
        }
        self.messages_sent += 1;
        self.members_dropped += report.dropped.len() as u64;
        report
    }

    fn send_to(&mut self, conn: ConnectionId, frame: Frame) -> bool {
        let Some(outbox) = self.members.get(&conn) else {
            return false;
        };
        let delivered = Self::deliver(outbox, conn, frame);
        if delivered {
            self.messages_sent += 1;
        } else {
            self.members.remove(&conn);
            self.members_dropped += 1;
        }
        delivered
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            members_dropped: self.members_dropped,
            active_members: self.members.len(),
        }
    }
}
