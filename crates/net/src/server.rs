//! TCP server attaching room semantics to each connection
//!
//! Accepts connections, assigns each a fresh id, binds a
//! [`RoomHandle`] to it, and routes protocol commands through the
//! shared room registry. Outbound delivery goes through the
//! [`Switchboard`], which is the registry's [`Transport`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use chorus_rooms::{ConnId, MemoryRegistry, RoomHandle, Transport};
use chrono::Utc;
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Message, RoomResult};

/// Outbound queue depth per connection
const SEND_QUEUE: usize = 64;

/// The registry type this server shares across connections
pub type ServerRegistry = MemoryRegistry<Switchboard>;

/// Connection id -> outbound sender map; the registry's delivery seam.
#[derive(Clone, Default)]
pub struct Switchboard {
    senders: Arc<RwLock<HashMap<ConnId, mpsc::Sender<Message>>>>,
}

impl Switchboard {
    fn register(&self, conn: ConnId, tx: mpsc::Sender<Message>) {
        if let Ok(mut senders) = self.senders.write() {
            senders.insert(conn, tx);
        }
    }

    fn unregister(&self, conn: ConnId) {
        if let Ok(mut senders) = self.senders.write() {
            senders.remove(&conn);
        }
    }

    fn notify_all(&self, msg: Message) {
        let Ok(senders) = self.senders.read() else {
            return;
        };
        for tx in senders.values() {
            let _ = tx.try_send(msg.clone());
        }
    }

    /// Number of live connections
    pub fn connections(&self) -> usize {
        self.senders.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl Transport for Switchboard {
    type Msg = Message;

    /// Queue a message for one connection. Fire-and-forget: an
    /// unknown recipient or a saturated peer queue drops the message
    /// without surfacing an error.
    fn deliver(&self, conn: ConnId, msg: Message) {
        let Ok(senders) = self.senders.read() else {
            return;
        };
        if let Some(tx) = senders.get(&conn) {
            if tx.try_send(msg).is_err() {
                debug!(conn = %conn, "peer queue full, dropping message");
            }
        }
    }
}

/// Room server handle
pub struct Server {
    addr: SocketAddr,
    registry: Arc<ServerRegistry>,
    switchboard: Switchboard,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Start a new server on the given port (0 picks a free one)
    pub async fn start(port: u16) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let switchboard = Switchboard::default();
        let registry = Arc::new(MemoryRegistry::new(switchboard.clone()));

        tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            switchboard.clone(),
            shutdown_tx.subscribe(),
        ));

        Ok(Server {
            addr: bound_addr,
            registry,
            switchboard,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared room registry, for host code that broadcasts outside
    /// any single connection (server-originated events)
    pub fn registry(&self) -> Arc<ServerRegistry> {
        self.registry.clone()
    }

    /// Number of live connections
    pub fn connections(&self) -> usize {
        self.switchboard.connections()
    }

    /// Shutdown the server, notifying connected peers
    pub fn shutdown(&self) {
        self.switchboard.notify_all(Message::Shutdown);
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ServerRegistry>,
    switchboard: Switchboard,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let registry = registry.clone();
                        let switchboard = switchboard.clone();
                        tokio::spawn(handle_connection(stream, addr, registry, switchboard));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ServerRegistry>,
    switchboard: Switchboard,
) {
    let conn_id = Uuid::new_v4();
    let (mut reader, writer) = tokio::io::split(stream);

    let (msg_tx, msg_rx) = mpsc::channel(SEND_QUEUE);
    switchboard.register(conn_id, msg_tx.clone());
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    let handle = RoomHandle::new(conn_id, registry);

    info!(addr = %addr, conn = %conn_id, "Connection accepted");

    let _ = msg_tx.send(Message::Welcome { conn_id }).await;

    loop {
        match read_frame(&mut reader).await {
            Ok(msg) => {
                if let Err(e) = handle_message(msg, &handle, &msg_tx).await {
                    warn!(conn = %conn_id, error = %e, "Dispatch error");
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!(conn = %conn_id, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(conn = %conn_id, error = %e, "Read error");
                break;
            }
        }
    }

    // Membership teardown runs exactly once, when the connection
    // closes, whatever room state the peer left behind.
    if let Err(e) = handle.leave_all().await {
        warn!(conn = %conn_id, error = %e, "Failed to leave rooms on close");
    }
    switchboard.unregister(conn_id);
    writer_handle.abort();

    info!(conn = %conn_id, "Connection removed");
}

/// Writer task - sends messages to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Dispatch one protocol command through the connection's room handle
async fn handle_message(
    msg: Message,
    handle: &RoomHandle<ServerRegistry>,
    reply: &mpsc::Sender<Message>,
) -> Result<()> {
    match msg {
        Message::Join { rooms } => {
            let outcomes = handle.join_many(rooms.iter().cloned()).await;
            let results = room_results(rooms, outcomes);
            send_reply(reply, Message::JoinAck { results }).await?;
        }
        Message::Leave { rooms } => {
            let outcomes = handle.leave_many(rooms.iter().cloned()).await;
            let results = room_results(rooms, outcomes);
            send_reply(reply, Message::LeaveAck { results }).await?;
        }
        Message::LeaveAll => {
            handle.leave_all().await?;
            send_reply(reply, Message::RoomList { rooms: Vec::new() }).await?;
        }
        Message::Publish { rooms, body } => {
            let event = Message::Event {
                from: handle.conn_id(),
                rooms: rooms.clone(),
                body,
                timestamp: Utc::now(),
            };
            // Empty room list is "nothing to broadcast to", not an error
            handle.send_to(&rooms, event).await?;
        }
        Message::Clients { room } => {
            let clients = handle.clients(&room).await?;
            send_reply(reply, Message::ClientList { room, clients }).await?;
        }
        Message::Rooms => {
            let rooms = handle.rooms().await;
            send_reply(reply, Message::RoomList { rooms }).await?;
        }
        Message::Ping => {
            send_reply(reply, Message::Pong).await?;
        }
        other => {
            debug!(conn = %handle.conn_id(), ?other, "Ignoring unexpected message");
        }
    }
    Ok(())
}

async fn send_reply(reply: &mpsc::Sender<Message>, msg: Message) -> Result<()> {
    reply.send(msg).await.map_err(|_| Error::NotConnected)
}

/// Pair batch outcomes back up with the rooms they were issued for
fn room_results(rooms: Vec<String>, outcomes: Vec<chorus_rooms::Result<()>>) -> Vec<RoomResult> {
    rooms
        .into_iter()
        .zip(outcomes)
        .map(|(room, outcome)| RoomResult {
            room,
            error: outcome.err().map(|e| e.to_string()),
        })
        .collect()
}
