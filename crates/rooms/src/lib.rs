//! Chorus Rooms
//!
//! Room membership and broadcast for real-time connections.
//!
//! # Architecture
//!
//! - **Registry**: process-wide store of room/connection membership,
//!   shared by every connection of a server
//! - **RoomHandle**: per-connection facade that joins and leaves
//!   rooms and composes outgoing broadcasts
//! - **Transport**: the fire-and-forget delivery seam the host
//!   integration implements
//!
//! # Usage
//!
//! ```ignore
//! let registry = Arc::new(MemoryRegistry::new(transport));
//!
//! // One handle per accepted connection
//! let handle = RoomHandle::new(conn_id, registry.clone());
//! handle.join("lobby").await?;
//! handle.room("lobby").await.send(msg).await?;
//!
//! // On connection close
//! handle.leave_all().await?;
//! ```

pub mod error;
pub mod handle;
pub mod registry;

pub use error::{Error, Result};
pub use handle::{RoomHandle, RoomTarget};
pub use registry::{BroadcastOptions, ConnId, MemoryRegistry, Registry, Transport};
