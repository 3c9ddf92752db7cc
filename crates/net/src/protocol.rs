//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//! Room payloads are opaque to the rooms layer; the protocol carries
//! them as strings.

use chrono::{DateTime, Utc};
use chorus_rooms::ConnId;
use serde::{Deserialize, Serialize};

/// Per-room outcome of a batch join or leave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomResult {
    pub room: String,
    /// `None` on success, the error description otherwise
    pub error: Option<String>,
}

impl RoomResult {
    /// True when the room operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Network protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Server assigns the connection its id right after accept
    Welcome { conn_id: ConnId },

    /// Client asks to join one or more rooms
    Join { rooms: Vec<String> },

    /// Per-room outcomes of a Join, in request order
    JoinAck { results: Vec<RoomResult> },

    /// Client asks to leave one or more rooms
    Leave { rooms: Vec<String> },

    /// Per-room outcomes of a Leave, in request order
    LeaveAck { results: Vec<RoomResult> },

    /// Client leaves every joined room
    LeaveAll,

    /// Client broadcasts a payload to the given rooms
    Publish { rooms: Vec<String>, body: String },

    /// A broadcast delivered to this connection
    Event {
        from: ConnId,
        rooms: Vec<String>,
        body: String,
        timestamp: DateTime<Utc>,
    },

    /// Client asks who is in a room
    Clients { room: String },

    /// Members of a room at query time
    ClientList { room: String, clients: Vec<ConnId> },

    /// Client asks which rooms it has joined
    Rooms,

    /// Rooms the connection has joined, in join order
    RoomList { rooms: Vec<String> },

    /// Ping to keep connection alive
    Ping,

    /// Pong response to ping
    Pong,

    /// Server is shutting down
    Shutdown,
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_event_roundtrip() {
        let msg = Message::Event {
            from: Uuid::new_v4(),
            rooms: vec!["lobby".to_string()],
            body: "Hello".to_string(),
            timestamp: Utc::now(),
        };

        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        match decoded {
            Message::Event { body, rooms, .. } => {
                assert_eq!(body, "Hello");
                assert_eq!(rooms, vec!["lobby"]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_room_result() {
        let ok = RoomResult {
            room: "a".to_string(),
            error: None,
        };
        let failed = RoomResult {
            room: "b".to_string(),
            error: Some("backing store error".to_string()),
        };

        assert!(ok.is_ok());
        assert!(!failed.is_ok());
    }
}
