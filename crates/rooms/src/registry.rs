//! Room registry - shared store of room/connection membership
//!
//! One registry exists per server instance and is shared by every
//! connection's [`RoomHandle`](crate::handle::RoomHandle). It owns no
//! network code: delivery goes through the [`Transport`] it was built
//! with.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Opaque identifier for a live connection, assigned by the transport.
/// The registry only ever compares it.
pub type ConnId = Uuid;

/// Targeting for a single broadcast.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Rooms whose members receive the message
    pub rooms: Vec<String>,
    /// Connections that must not receive it (typically the sender)
    pub except: HashSet<ConnId>,
}

impl BroadcastOptions {
    /// Target the given rooms, excluding nobody.
    pub fn new<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rooms: rooms.into_iter().map(Into::into).collect(),
            except: HashSet::new(),
        }
    }

    /// Exclude a connection from delivery.
    pub fn except(mut self, conn: ConnId) -> Self {
        self.except.insert(conn);
        self
    }
}

/// Outbound delivery into the transport layer.
///
/// Delivery is fire-and-forget: the registry never learns whether the
/// payload reached the peer, and a slow or dead recipient must not
/// stall anyone else. Implementations typically queue on a bounded
/// per-connection channel.
pub trait Transport: Send + Sync + 'static {
    /// Payload handed to connections.
    type Msg: Clone + Send + Sync + 'static;

    /// Queue a message for one connection. Must not block.
    fn deliver(&self, conn: ConnId, msg: Self::Msg);
}

/// Membership store contract.
///
/// Every operation is fallible so that fallible backing stores fit
/// behind the same seam; [`MemoryRegistry`] never reports an error.
/// All operations are safe to call from many connections at once.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Payload type accepted by [`Registry::broadcast`].
    type Msg: Clone + Send + Sync + 'static;

    /// Add a connection to a room. Re-adding is a no-op success.
    async fn add(&self, conn: ConnId, room: &str) -> Result<()>;

    /// Remove a connection from a room. Removing from a room never
    /// joined is a no-op success.
    async fn remove(&self, conn: ConnId, room: &str) -> Result<()>;

    /// Remove a connection from every room it has joined.
    async fn remove_all(&self, conn: ConnId) -> Result<()>;

    /// Current members of a room. An unknown room is empty.
    async fn members(&self, room: &str) -> Result<Vec<ConnId>>;

    /// Deliver `msg` exactly once to every member of the targeted
    /// rooms, minus the excluded connections - a connection in several
    /// targeted rooms still receives one copy.
    async fn broadcast(&self, msg: Self::Msg, opts: BroadcastOptions) -> Result<()>;
}

/// Both membership indices, guarded together so a reader never sees
/// one updated and its mirror stale.
#[derive(Debug, Default)]
struct Membership {
    /// Room name -> member connections
    room_members: HashMap<String, HashSet<ConnId>>,
    /// Connection -> rooms in join order
    conn_rooms: HashMap<ConnId, Vec<String>>,
}

/// In-memory registry shared by every connection of one server.
pub struct MemoryRegistry<T: Transport> {
    membership: RwLock<Membership>,
    transport: T,
}

impl<T: Transport> MemoryRegistry<T> {
    /// Create an empty registry delivering through `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            membership: RwLock::new(Membership::default()),
            transport,
        }
    }

    /// Rooms a connection has joined, in join order.
    pub async fn rooms(&self, conn: ConnId) -> Vec<String> {
        let m = self.membership.read().await;
        m.conn_rooms.get(&conn).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl<T: Transport> Registry for MemoryRegistry<T> {
    type Msg = T::Msg;

    async fn add(&self, conn: ConnId, room: &str) -> Result<()> {
        let mut m = self.membership.write().await;
        let inserted = m
            .room_members
            .entry(room.to_string())
            .or_default()
            .insert(conn);
        if inserted {
            m.conn_rooms.entry(conn).or_default().push(room.to_string());
            debug!(conn = %conn, room = room, "joined room");
        }
        Ok(())
    }

    async fn remove(&self, conn: ConnId, room: &str) -> Result<()> {
        let mut m = self.membership.write().await;
        let (removed, now_empty) = match m.room_members.get_mut(room) {
            Some(members) => (members.remove(&conn), members.is_empty()),
            None => (false, false),
        };
        if now_empty {
            m.room_members.remove(room);
        }
        if removed {
            if let Some(rooms) = m.conn_rooms.get_mut(&conn) {
                rooms.retain(|r| r != room);
            }
            debug!(conn = %conn, room = room, "left room");
        }
        Ok(())
    }

    async fn remove_all(&self, conn: ConnId) -> Result<()> {
        let mut m = self.membership.write().await;
        if let Some(rooms) = m.conn_rooms.remove(&conn) {
            for room in &rooms {
                let now_empty = match m.room_members.get_mut(room) {
                    Some(members) => {
                        members.remove(&conn);
                        members.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    m.room_members.remove(room);
                }
            }
            debug!(conn = %conn, rooms = rooms.len(), "left all rooms");
        }
        Ok(())
    }

    async fn members(&self, room: &str) -> Result<Vec<ConnId>> {
        let m = self.membership.read().await;
        Ok(m.room_members
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn broadcast(&self, msg: Self::Msg, opts: BroadcastOptions) -> Result<()> {
        // Snapshot the deduplicated recipient set under the lock, then
        // deliver after releasing it so a slow transport cannot stall
        // concurrent joins and leaves.
        let recipients: Vec<ConnId> = {
            let m = self.membership.read().await;
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for room in &opts.rooms {
                if let Some(members) = m.room_members.get(room) {
                    for conn in members {
                        if !opts.except.contains(conn) && seen.insert(*conn) {
                            out.push(*conn);
                        }
                    }
                }
            }
            out
        };

        debug!(rooms = ?opts.rooms, recipients = recipients.len(), "broadcast");
        for conn in recipients {
            self.transport.deliver(conn, msg.clone());
        }
        Ok(())
    }
}
