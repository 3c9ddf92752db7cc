//! Per-connection room handle
//!
//! One handle is bound to exactly one connection id. It forwards
//! join/leave requests to the shared [`Registry`], keeps a local
//! join-ordered cache of the rooms this connection is in, and
//! composes outgoing broadcasts (always excluding the sender).

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::registry::{BroadcastOptions, ConnId, Registry};

/// Room facade for a single connection.
pub struct RoomHandle<R: Registry> {
    conn: ConnId,
    registry: Arc<R>,
    /// Rooms this connection has joined, in join order. Every
    /// mutation holds the write lock across the registry call and the
    /// cache update, so a concurrent `leave_all` cannot land between
    /// the two and leave the cache diverged from the registry.
    joined: RwLock<Vec<String>>,
    /// Rooms accumulated as broadcast targets via [`RoomHandle::room`].
    /// Targeting a room does not join it.
    targets: RwLock<Vec<String>>,
}

impl<R: Registry> RoomHandle<R> {
    /// Bind a handle to a connection id.
    pub fn new(conn: ConnId, registry: Arc<R>) -> Self {
        Self {
            conn,
            registry,
            joined: RwLock::new(Vec::new()),
            targets: RwLock::new(Vec::new()),
        }
    }

    /// The bound connection id.
    pub fn conn_id(&self) -> ConnId {
        self.conn
    }

    /// Join a single room. Joining a room already joined is a no-op
    /// success that leaves the join order untouched.
    pub async fn join(&self, room: &str) -> Result<()> {
        if self.joined.read().await.iter().any(|r| r == room) {
            return Ok(());
        }
        // Hold the lock across the registry call so nothing can
        // interleave between the store mutation and the cache push.
        let mut joined = self.joined.write().await;
        if joined.iter().any(|r| r == room) {
            return Ok(());
        }
        self.registry.add(self.conn, room).await?;
        joined.push(room.to_string());
        Ok(())
    }

    /// Join several rooms at once. The per-room joins run
    /// independently - one room failing does not stop the others -
    /// and the results come back in input order once all have settled.
    pub async fn join_many<I, S>(&self, rooms: I) -> Vec<Result<()>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms: Vec<String> = rooms.into_iter().map(Into::into).collect();
        join_all(rooms.iter().map(|room| self.join(room))).await
    }

    /// Leave a single room. Leaving a room never joined is a no-op
    /// success.
    pub async fn leave(&self, room: &str) -> Result<()> {
        let mut joined = self.joined.write().await;
        self.registry.remove(self.conn, room).await?;
        joined.retain(|r| r != room);
        Ok(())
    }

    /// Leave several rooms at once, with the same aggregation
    /// semantics as [`RoomHandle::join_many`].
    pub async fn leave_many<I, S>(&self, rooms: I) -> Vec<Result<()>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms: Vec<String> = rooms.into_iter().map(Into::into).collect();
        join_all(rooms.iter().map(|room| self.leave(room))).await
    }

    /// Leave every joined room. The transport calls this exactly once
    /// when the connection closes; application code may also call it
    /// explicitly.
    pub async fn leave_all(&self) -> Result<()> {
        let mut joined = self.joined.write().await;
        self.registry.remove_all(self.conn).await?;
        joined.clear();
        debug!(conn = %self.conn, "left all rooms");
        Ok(())
    }

    /// Rooms this connection has joined, in join order.
    pub async fn rooms(&self) -> Vec<String> {
        self.joined.read().await.clone()
    }

    /// Target `name` - or a space-separated list of names - for later
    /// [`RoomHandle::send`] calls, and return a sender scoped to just
    /// those rooms. Splitting happens here, never in the registry.
    pub async fn room(&self, name: &str) -> RoomTarget<'_, R> {
        let names: Vec<String> = name.split_whitespace().map(str::to_string).collect();
        {
            let mut targets = self.targets.write().await;
            for n in &names {
                if !targets.contains(n) {
                    targets.push(n.clone());
                }
            }
        }
        RoomTarget {
            handle: self,
            rooms: names,
        }
    }

    /// Broadcast to every room targeted so far. The sender never
    /// receives its own message. An empty target set is a silent
    /// no-op.
    pub async fn send(&self, msg: R::Msg) -> Result<()> {
        let rooms = self.targets.read().await.clone();
        self.send_to(&rooms, msg).await
    }

    /// Broadcast to exactly the given rooms, sender excluded. An
    /// empty room list is a silent no-op.
    pub async fn send_to(&self, rooms: &[String], msg: R::Msg) -> Result<()> {
        if rooms.is_empty() {
            return Ok(());
        }
        let opts = BroadcastOptions::new(rooms.iter().cloned()).except(self.conn);
        self.registry.broadcast(msg, opts).await
    }

    /// Current members of one room.
    pub async fn clients(&self, room: &str) -> Result<Vec<ConnId>> {
        self.registry.members(room).await
    }
}

/// Broadcast scope returned by [`RoomHandle::room`].
pub struct RoomTarget<'a, R: Registry> {
    handle: &'a RoomHandle<R>,
    rooms: Vec<String>,
}

impl<R: Registry> RoomTarget<'_, R> {
    /// Send to exactly the rooms this target is scoped to.
    pub async fn send(&self, msg: R::Msg) -> Result<()> {
        self.handle.send_to(&self.rooms, msg).await
    }

    /// Union of member ids across the scoped rooms, each id once, in
    /// first-seen order.
    pub async fn clients(&self) -> Result<Vec<ConnId>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for room in &self.rooms {
            for conn in self.handle.registry.members(room).await? {
                if seen.insert(conn) {
                    out.push(conn);
                }
            }
        }
        Ok(out)
    }
}
