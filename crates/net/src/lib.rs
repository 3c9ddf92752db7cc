//! Chorus Network Library
//!
//! TCP transport that attaches room membership to every connection.
//!
//! # Architecture
//!
//! - **Server**: accepts connections, assigns each an id, and binds a
//!   room handle to it
//! - **Client**: connects to a server and speaks the framed protocol
//! - **Protocol**: length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! // Host starts a server
//! let server = Server::start(7440).await?;
//!
//! // Client connects, joins rooms, publishes
//! let mut client = Client::connect(server.addr()).await?;
//! client.join(["lobby"]).await?;
//! client.publish(["lobby"], "hello").await?;
//!
//! // Process events
//! while let Some(event) = client.next_event().await {
//!     match event {
//!         ServerEvent::Event { body, .. } => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::{Client, ConnectionState, ServerEvent};
pub use error::{Error, Result};
pub use protocol::{Message, RoomResult};
pub use server::{Server, ServerRegistry, Switchboard};

/// Default port for Chorus servers
pub const DEFAULT_PORT: u16 = 7440;
