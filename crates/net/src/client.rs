//! TCP client for connecting to a room server

use std::net::SocketAddr;
use std::sync::Arc;

use chorus_rooms::ConnId;
use chrono::{DateTime, Utc};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Message, RoomResult};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Event received from the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server accepted the connection and assigned an id
    Welcome { conn_id: ConnId },
    /// Per-room outcomes of a join request, in request order
    Joined { results: Vec<RoomResult> },
    /// Per-room outcomes of a leave request, in request order
    Left { results: Vec<RoomResult> },
    /// A room broadcast reached this connection
    Event {
        from: ConnId,
        rooms: Vec<String>,
        body: String,
        timestamp: DateTime<Utc>,
    },
    /// Members of a queried room
    ClientList { room: String, clients: Vec<ConnId> },
    /// Rooms this connection has joined, in join order
    RoomList { rooms: Vec<String> },
    /// Pong response to a ping
    Pong,
    /// Server is shutting down
    ServerShutdown,
    /// Connection lost
    Disconnected,
}

/// Client handle for network operations
pub struct Client {
    state: Arc<RwLock<ClientState>>,
    event_rx: mpsc::Receiver<ServerEvent>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

struct ClientState {
    connection: ConnectionState,
    conn_id: Option<ConnId>,
}

enum ClientCommand {
    Send(Message),
    Disconnect,
}

impl Client {
    /// Connect to a room server
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        info!(addr = %addr, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = tokio::io::split(stream);

        let state = Arc::new(RwLock::new(ClientState {
            connection: ConnectionState::Connecting,
            conn_id: None,
        }));

        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let state_clone = state.clone();
        tokio::spawn(connection_task(reader, writer, state_clone, event_tx, cmd_rx));

        Ok(Client {
            state,
            event_rx,
            cmd_tx,
        })
    }

    /// Get the next server event
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.event_rx.recv().await
    }

    /// Ask to join one or more rooms
    pub async fn join<I, S>(&self, rooms: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Message::Join {
            rooms: rooms.into_iter().map(Into::into).collect(),
        })
        .await
    }

    /// Ask to leave one or more rooms
    pub async fn leave<I, S>(&self, rooms: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Message::Leave {
            rooms: rooms.into_iter().map(Into::into).collect(),
        })
        .await
    }

    /// Leave every joined room
    pub async fn leave_all(&self) -> Result<()> {
        self.send(Message::LeaveAll).await
    }

    /// Broadcast a payload to the given rooms
    pub async fn publish<I, S>(&self, rooms: I, body: &str) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Message::Publish {
            rooms: rooms.into_iter().map(Into::into).collect(),
            body: body.to_string(),
        })
        .await
    }

    /// Ask who is in a room
    pub async fn clients(&self, room: &str) -> Result<()> {
        self.send(Message::Clients {
            room: room.to_string(),
        })
        .await
    }

    /// Ask which rooms this connection has joined
    pub async fn rooms(&self) -> Result<()> {
        self.send(Message::Rooms).await
    }

    /// Send a ping
    pub async fn ping(&self) -> Result<()> {
        self.send(Message::Ping).await
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }

    /// Get the id the server assigned to this connection
    pub async fn conn_id(&self) -> Option<ConnId> {
        self.state.read().await.conn_id
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(msg))
            .await
            .map_err(|_| Error::NotConnected)
    }
}

/// Main connection task
async fn connection_task(
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    state: Arc<RwLock<ClientState>>,
    event_tx: mpsc::Sender<ServerEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    // The first frame must be the server's Welcome
    match read_frame(&mut reader).await {
        Ok(Message::Welcome { conn_id }) => {
            {
                let mut s = state.write().await;
                s.connection = ConnectionState::Connected;
                s.conn_id = Some(conn_id);
            }
            let _ = event_tx.send(ServerEvent::Welcome { conn_id }).await;
            info!(conn = %conn_id, "Connected");
        }
        Ok(_) => {
            warn!("Unexpected first message");
            state.write().await.connection = ConnectionState::Disconnected;
            return;
        }
        Err(e) => {
            error!(error = %e, "Failed to read welcome");
            state.write().await.connection = ConnectionState::Disconnected;
            return;
        }
    }

    // Main loop - handle incoming messages and outgoing commands
    loop {
        tokio::select! {
            // Incoming message from server
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => {
                        handle_server_message(msg, &event_tx).await;
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    {
        let mut s = state.write().await;
        s.connection = ConnectionState::Disconnected;
    }
    let _ = event_tx.send(ServerEvent::Disconnected).await;
    info!("Disconnected from server");
}

/// Handle a message from the server
async fn handle_server_message(msg: Message, event_tx: &mpsc::Sender<ServerEvent>) {
    match msg {
        Message::JoinAck { results } => {
            let _ = event_tx.send(ServerEvent::Joined { results }).await;
        }
        Message::LeaveAck { results } => {
            let _ = event_tx.send(ServerEvent::Left { results }).await;
        }
        Message::Event {
            from,
            rooms,
            body,
            timestamp,
        } => {
            let _ = event_tx
                .send(ServerEvent::Event {
                    from,
                    rooms,
                    body,
                    timestamp,
                })
                .await;
        }
        Message::ClientList { room, clients } => {
            let _ = event_tx.send(ServerEvent::ClientList { room, clients }).await;
        }
        Message::RoomList { rooms } => {
            let _ = event_tx.send(ServerEvent::RoomList { rooms }).await;
        }
        Message::Pong => {
            let _ = event_tx.send(ServerEvent::Pong).await;
        }
        Message::Shutdown => {
            let _ = event_tx.send(ServerEvent::ServerShutdown).await;
        }
        other => {
            debug!(?other, "Ignoring unexpected message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::server::Server;

    /// Drain events until one matches, with a hard timeout.
    async fn expect_event<F>(client: &mut Client, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next_event().await {
                    Some(ev) if pred(&ev) => return ev,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn connected_client(server: &Server) -> (Client, ConnId) {
        let mut client = Client::connect(server.addr()).await.unwrap();
        let ev = expect_event(&mut client, |e| matches!(e, ServerEvent::Welcome { .. })).await;
        let conn_id = match ev {
            ServerEvent::Welcome { conn_id } => conn_id,
            _ => unreachable!(),
        };
        (client, conn_id)
    }

    #[tokio::test]
    async fn test_client_connect() {
        let server = Server::start(0).await.unwrap();

        let (client, _) = connected_client(&server).await;
        assert_eq!(client.connection_state().await, ConnectionState::Connected);
        assert!(client.conn_id().await.is_some());

        client.disconnect().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_publish_reaches_room_members_once() {
        let server = Server::start(0).await.unwrap();
        let (mut c1, _) = connected_client(&server).await;
        let (mut c2, _) = connected_client(&server).await;

        c1.join(["lobby", "news"]).await.unwrap();
        expect_event(&mut c1, |e| matches!(e, ServerEvent::Joined { .. })).await;
        c2.join(["lobby", "news"]).await.unwrap();
        expect_event(&mut c2, |e| matches!(e, ServerEvent::Joined { .. })).await;

        // c2 is in both target rooms but must receive exactly one copy
        c1.publish(["lobby", "news"], "hello").await.unwrap();

        let ev = expect_event(&mut c2, |e| matches!(e, ServerEvent::Event { .. })).await;
        match ev {
            ServerEvent::Event { body, .. } => assert_eq!(body, "hello"),
            _ => unreachable!(),
        }

        // A pong fences the queue: no duplicate copy for c2, and
        // nothing echoed back to the sender.
        c2.ping().await.unwrap();
        let ev = expect_event(&mut c2, |e| {
            matches!(e, ServerEvent::Event { .. } | ServerEvent::Pong)
        })
        .await;
        assert!(matches!(ev, ServerEvent::Pong));

        c1.ping().await.unwrap();
        let ev = expect_event(&mut c1, |e| {
            matches!(e, ServerEvent::Event { .. } | ServerEvent::Pong)
        })
        .await;
        assert!(matches!(ev, ServerEvent::Pong));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_room_queries_track_membership() {
        let server = Server::start(0).await.unwrap();
        let (mut client, conn_id) = connected_client(&server).await;

        client.join(["a", "b"]).await.unwrap();
        expect_event(&mut client, |e| matches!(e, ServerEvent::Joined { .. })).await;

        client.rooms().await.unwrap();
        let ev = expect_event(&mut client, |e| matches!(e, ServerEvent::RoomList { .. })).await;
        match ev {
            ServerEvent::RoomList { rooms } => assert_eq!(rooms, vec!["a", "b"]),
            _ => unreachable!(),
        }

        client.leave(["b"]).await.unwrap();
        expect_event(&mut client, |e| matches!(e, ServerEvent::Left { .. })).await;

        client.rooms().await.unwrap();
        let ev = expect_event(&mut client, |e| matches!(e, ServerEvent::RoomList { .. })).await;
        match ev {
            ServerEvent::RoomList { rooms } => assert_eq!(rooms, vec!["a"]),
            _ => unreachable!(),
        }

        client.clients("a").await.unwrap();
        let ev = expect_event(&mut client, |e| matches!(e, ServerEvent::ClientList { .. })).await;
        match ev {
            ServerEvent::ClientList { room, clients } => {
                assert_eq!(room, "a");
                assert_eq!(clients, vec![conn_id]);
            }
            _ => unreachable!(),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let server = Server::start(0).await.unwrap();
        let (mut c1, _) = connected_client(&server).await;
        let (mut c2, c2_id) = connected_client(&server).await;

        c1.join(["shared"]).await.unwrap();
        expect_event(&mut c1, |e| matches!(e, ServerEvent::Joined { .. })).await;
        c2.join(["shared"]).await.unwrap();
        expect_event(&mut c2, |e| matches!(e, ServerEvent::Joined { .. })).await;

        c1.disconnect().await;

        // Teardown is asynchronous; poll until the registry reflects it
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                c2.clients("shared").await.unwrap();
                let ev =
                    expect_event(&mut c2, |e| matches!(e, ServerEvent::ClientList { .. })).await;
                if let ServerEvent::ClientList { clients, .. } = ev {
                    if clients == vec![c2_id] {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("c1 was never removed from the room");

        server.shutdown();
    }
}
