//! TCP server implementation.
//!
//! Three kinds of tasks cooperate: one accept loop, one handshake task per
//! accepted socket (bounded by the connection timeout) and one periodic
//! driver that ticks every admitted connection.

use crate::admission::{Admission, AdmissionError, Slot};
use crate::error::ServerError;
use crate::events::{ServerEvent, DEFAULT_EVENT_CAPACITY};
use dashmap::DashMap;
use easycom_core::{
    Connection, DisconnectCause, Dispatcher, PeerConfig, Responder, TickOutcome,
};
use easycom_protocol::{decode_handshake, Message, PeerId, Reply, HANDSHAKE_SIZE};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: u32 = 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections, handshakes included.
    pub max_connections: usize,
    /// Admit only peers that claim a reserved seat.
    pub use_seat_admission: bool,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Settings applied to every accepted connection.
    pub peer: PeerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7500)),
            max_connections: 1000,
            use_seat_admission: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            peer: PeerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_seat_admission(mut self, enabled: bool) -> Self {
        self.use_seat_admission = enabled;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peer = peer;
        self
    }
}

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Off,
    Starting,
    Listening,
    Closing,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Off => "off",
            ServerState::Starting => "starting",
            ServerState::Listening => "listening",
            ServerState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_timed_out: AtomicU64,
    pub outdated_responses: AtomicU64,
}

struct ActivePeer {
    conn: Arc<Connection>,
    _slot: Slot,
}

struct Shared {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    admission: Arc<Admission>,
    peers: DashMap<PeerId, ActivePeer>,
    events: broadcast::Sender<ServerEvent>,
    stats: Arc<ServerStats>,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
}

/// TCP server for easycom.
pub struct Server {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = broadcast::channel(1);
        let stats = Arc::new(ServerStats::default());

        let dispatcher = Arc::new(Dispatcher::new());
        {
            let events = events.clone();
            let stats = stats.clone();
            dispatcher.set_outdated_handler(move |peer, reply| {
                stats.outdated_responses.fetch_add(1, Ordering::Relaxed);
                let _ = events.send(ServerEvent::OutdatedResponse { peer, reply });
            });
        }

        let admission = Arc::new(Admission::new(
            config.max_connections,
            config.use_seat_admission,
        ));

        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                admission,
                peers: DashMap::new(),
                events,
                stats,
                state: Mutex::new(ServerState::Off),
                local_addr: Mutex::new(None),
                shutdown,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Listening
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Registers a named endpoint that peers can call.
    pub fn register_endpoint<F>(&self, name: &str, handler: F) -> Result<(), ServerError>
    where
        F: Fn(PeerId, String, Responder) + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_endpoint(name, handler)?;
        Ok(())
    }

    /// Registers `T` and routes every received `T` to `handler`.
    pub fn register_message_handler<T, F>(&self, handler: F) -> Result<(), ServerError>
    where
        T: Message,
        F: Fn(PeerId, T) + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_message_handler(handler)?;
        Ok(())
    }

    /// Registers a message type the server only sends.
    pub fn register_message<T: Message>(&self) -> Result<(), ServerError> {
        self.shared.dispatcher.register_message::<T>()?;
        Ok(())
    }

    /// Binds the listener and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ServerState::Off {
                return Err(ServerError::InvalidState(*state));
            }
            *state = ServerState::Starting;
        }

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                *self.shared.state.lock() = ServerState::Off;
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;

        self.shared.admission.reset();
        *self.shared.local_addr.lock() = Some(addr);
        *self.shared.state.lock() = ServerState::Listening;

        let accept = tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            self.shared.shutdown.subscribe(),
        ));
        let driver = tokio::spawn(drive_loop(
            self.shared.clone(),
            self.shared.shutdown.subscribe(),
        ));
        self.tasks.lock().extend([accept, driver]);

        tracing::info!(
            "Server listening on {} (max {} connections, seat admission {})",
            addr,
            self.shared.admission.capacity(),
            if self.shared.admission.seat_mode() { "on" } else { "off" }
        );
        Ok(addr)
    }

    fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.shared.config.bind_addr;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;

        let buffer = self.shared.config.peer.socket_buffer_size();
        socket.set_recv_buffer_size(buffer)?;
        socket.set_send_buffer_size(buffer)?;

        socket.bind(addr)?;
        Ok(socket.listen(LISTEN_BACKLOG)?)
    }

    /// Disconnects every peer and stops listening.
    pub async fn stop(&self) -> Result<(), ServerError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ServerState::Listening {
                return Err(ServerError::InvalidState(*state));
            }
            *state = ServerState::Closing;
        }
        tracing::info!("Server shutting down");

        let _ = self.shared.shutdown.send(());
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        for conn in self.shared.connections() {
            conn.disconnect(DisconnectCause::Shutdown);
        }
        self.shared.tick_all();
        self.shared.peers.clear();

        self.shared.admission.reset();
        *self.shared.local_addr.lock() = None;
        *self.shared.state.lock() = ServerState::Off;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Requests teardown of `peer`'s connection.
    pub fn disconnect_client(&self, peer: PeerId) -> bool {
        match self.shared.connection(peer) {
            Some(conn) => conn.disconnect(DisconnectCause::Requested),
            None => false,
        }
    }

    /// Reserves an identity for a peer that has not connected yet.
    pub fn reserve_seat(&self) -> Option<PeerId> {
        let seat = self.shared.admission.reserve_seat();
        match seat {
            Some(seat) => tracing::debug!("Reserved seat {}", seat),
            None => tracing::warn!("No free identity left to reserve"),
        }
        seat
    }

    /// Cancels a seat reservation.
    pub fn release_seat(&self, peer: PeerId) -> bool {
        self.shared.admission.release_seat(peer)
    }

    pub fn is_reserved(&self, peer: PeerId) -> bool {
        self.shared.admission.is_reserved(peer)
    }

    pub fn reserved_seats(&self) -> Vec<PeerId> {
        self.shared.admission.reserved_seats()
    }

    /// Identities of the connected peers, in ascending order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.shared.peers.iter().map(|e| *e.key()).collect();
        peers.sort_unstable();
        peers
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.shared
            .connection(peer)
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    /// Remote address of a connected peer.
    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.shared.connection(peer).and_then(|conn| conn.remote_addr())
    }

    /// Queues a message to `peer`.
    pub fn send_message<T: Message>(&self, peer: PeerId, msg: &T) -> Result<(), ServerError> {
        match self.shared.connection(peer) {
            Some(conn) => Ok(conn.send(msg)?),
            None if self.shared.config.peer.fail_on_send_while_disconnected => {
                Err(ServerError::UnknownPeer(peer))
            }
            None => Ok(()),
        }
    }

    /// Queues a message to every connected peer. Returns how many accepted it.
    pub fn broadcast_message<T: Message>(&self, msg: &T) -> usize {
        self.shared
            .connections()
            .into_iter()
            .filter(|conn| conn.send(msg).is_ok())
            .count()
    }

    /// Calls `endpoint` on `peer` and waits for the response.
    pub async fn request(
        &self,
        peer: PeerId,
        endpoint: &str,
        body: impl Into<String>,
    ) -> Result<Reply, ServerError> {
        let Some(conn) = self.shared.connection(peer) else {
            if self.shared.config.peer.fail_on_request_while_disconnected {
                return Err(ServerError::UnknownPeer(peer));
            }
            return Ok(Reply::timeout());
        };

        self.shared.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        let reply = conn.request(endpoint, body).await?;
        if reply.is_timeout() {
            self.shared.stats.requests_timed_out.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[peer {}] Request to {} timed out", peer, endpoint);
            self.shared.emit(ServerEvent::RequestTimedOut {
                peer,
                endpoint: endpoint.to_string(),
            });
        }
        Ok(reply)
    }

    /// Like [`Server::request`], with `body` serialized as JSON.
    pub async fn request_json<T: Serialize>(
        &self,
        peer: PeerId,
        endpoint: &str,
        body: &T,
    ) -> Result<Reply, ServerError> {
        let body = serde_json::to_string(body)?;
        self.request(peer, endpoint, body).await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(());
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("peers", &self.shared.peers.len())
            .finish()
    }
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn connection(&self, peer: PeerId) -> Option<Arc<Connection>> {
        self.peers.get(&peer).map(|p| p.conn.clone())
    }

    /// Snapshot of the active connections; no map lock is held afterwards.
    fn connections(&self) -> Vec<Arc<Connection>> {
        self.peers.iter().map(|p| p.conn.clone()).collect()
    }

    fn tick_all(&self) {
        for conn in self.connections() {
            if let TickOutcome::Closed(cause) = conn.tick() {
                self.remove_peer(conn.peer(), cause);
            }
        }
    }

    fn remove_peer(&self, peer: PeerId, cause: DisconnectCause) {
        if self.peers.remove(&peer).is_none() {
            return;
        }
        self.admission.reclaim(peer);
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        tracing::info!("Client {} disconnected: {}", peer, cause);
        self.emit(ServerEvent::ClientDisconnected { peer, cause });
    }

    fn reject(&self, addr: SocketAddr, cause: DisconnectCause) {
        self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
        self.emit(ServerEvent::ConnectionRejected { addr, cause });
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let Some(slot) = shared.admission.try_acquire_slot() else {
                            tracing::warn!("Connection limit reached, rejecting {}", addr);
                            shared.reject(addr, DisconnectCause::ServerFull);
                            continue;
                        };
                        tokio::spawn(handshake(shared.clone(), stream, addr, slot));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Accept loop stopped");
                break;
            }
        }
    }
}

async fn drive_loop(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(shared.config.peer.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => shared.tick_all(),
            _ = shutdown.recv() => break,
        }
    }
}

/// Reads the identity header and runs admission.
async fn handshake(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr, slot: Slot) {
    let conn = Connection::new(shared.dispatcher.clone(), shared.config.peer.clone());
    if conn.begin_connect().is_err() {
        return;
    }

    let mut header = [0u8; HANDSHAKE_SIZE];
    let read = tokio::time::timeout(
        shared.config.peer.connection_timeout,
        stream.read_exact(&mut header),
    )
    .await;
    match read {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::debug!("[{}] Handshake read failed: {}", addr, e);
            conn.abort(DisconnectCause::InvalidHandshake);
            shared.reject(addr, DisconnectCause::InvalidHandshake);
            return;
        }
        Err(_) => {
            tracing::warn!("[{}] Handshake timed out", addr);
            conn.abort(DisconnectCause::InvalidHandshake);
            shared.reject(addr, DisconnectCause::InvalidHandshake);
            return;
        }
    }
    let claimed = decode_handshake(header);

    // Holding the state lock keeps `stop` from clearing the peer table
    // between the check and the insert.
    let state = shared.state.lock();
    if *state != ServerState::Listening {
        conn.abort(DisconnectCause::Shutdown);
        return;
    }

    match shared.admission.admit(claimed) {
        Ok(peer) => {
            conn.attach(stream);
            conn.establish(peer);
            shared.peers.insert(peer, ActivePeer { conn, _slot: slot });
            shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
            shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Client {} connected from {}", peer, addr);
            shared.emit(ServerEvent::ClientConnected { peer, addr });
        }
        Err(AdmissionError::Duplicate(peer)) => {
            tracing::warn!(
                "Client with seat id {} is already connected, disconnecting redundant",
                peer
            );
            conn.abort(DisconnectCause::DuplicateIdentity);
            shared.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            shared.emit(ServerEvent::DuplicateConnection { peer });
        }
        Err(AdmissionError::Unexpected(peer)) => {
            tracing::warn!("Client with seat id {} is not expected to connect", peer);
            conn.abort(DisconnectCause::UnexpectedIdentity);
            shared.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            shared.emit(ServerEvent::UnexpectedClient { peer });
        }
        Err(AdmissionError::Exhausted) => {
            tracing::warn!("[{}] No free identity, rejecting", addr);
            conn.abort(DisconnectCause::ServerFull);
            shared.reject(addr, DisconnectCause::ServerFull);
        }
    }
    drop(state);
}
