//! High-level client API.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::ClientEvent;
use easycom_core::{
    Connection, ConnectionState, DisconnectCause, Dispatcher, Responder, TickOutcome,
};
use easycom_protocol::{encode_handshake, Message, PeerId, Reply};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpSocket, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Session {
    conn: Arc<Connection>,
    driver: Option<JoinHandle<()>>,
}

/// Client side of an easycom connection.
///
/// One client holds at most one connection at a time; after it closes the
/// same client can connect again.
pub struct Client {
    config: Mutex<ClientConfig>,
    dispatcher: Arc<Dispatcher>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Client {
    /// Creates a new, unconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let dispatcher = Arc::new(Dispatcher::new());
        {
            let events = events.clone();
            dispatcher.set_outdated_handler(move |_, reply| {
                let _ = events.send(ClientEvent::OutdatedResponse { reply });
            });
        }

        Self {
            config: Mutex::new(config),
            dispatcher,
            session: Mutex::new(None),
            events,
        }
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn seat_id(&self) -> PeerId {
        self.config.lock().seat_id
    }

    /// Changes the identity sent by the next handshake.
    pub fn set_seat_id(&self, seat_id: PeerId) {
        self.config.lock().seat_id = seat_id;
    }

    pub fn state(&self) -> ConnectionState {
        self.connection()
            .map(|conn| conn.state())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Address of the server while connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection().and_then(|conn| conn.remote_addr())
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.connection()
            .map(|conn| conn.pending_requests())
            .unwrap_or(0)
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.session.lock().as_ref().map(|s| s.conn.clone())
    }

    /// The current connection unless it has already settled.
    fn live_connection(&self) -> Option<Arc<Connection>> {
        self.connection()
            .filter(|conn| conn.state() != ConnectionState::NotConnected)
    }

    /// Registers a named endpoint the server can call.
    pub fn register_endpoint<F>(&self, name: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(String, Responder) + Send + Sync + 'static,
    {
        self.dispatcher
            .register_endpoint(name, move |_, body, responder| handler(body, responder))?;
        Ok(())
    }

    /// Registers `T` and routes every received `T` to `handler`.
    pub fn register_message_handler<T, F>(&self, handler: F) -> Result<(), ClientError>
    where
        T: Message,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.dispatcher
            .register_message_handler(move |_, msg: T| handler(msg))?;
        Ok(())
    }

    /// Registers a message type the client only sends.
    pub fn register_message<T: Message>(&self) -> Result<(), ClientError> {
        self.dispatcher.register_message::<T>()?;
        Ok(())
    }

    /// Connects to a server and performs the handshake.
    ///
    /// Fails if a connection is already open or in progress.
    pub async fn connect(&self, addr: impl ToSocketAddrs) -> Result<(), ClientError> {
        let (seat_id, peer_config) = {
            let config = self.config.lock();
            (config.seat_id, config.peer.clone())
        };

        let conn = {
            let mut session = self.session.lock();
            if let Some(current) = session.as_ref() {
                let state = current.conn.state();
                if state != ConnectionState::NotConnected {
                    return Err(ClientError::AlreadyConnected(state));
                }
            }
            let conn = Connection::new(self.dispatcher.clone(), peer_config.clone());
            conn.begin_connect()?;
            *session = Some(Session {
                conn: conn.clone(),
                driver: None,
            });
            conn
        };
        // Settles the session if this future is dropped mid-connect.
        let mut pending = ConnectGuard(Some(conn.clone()));

        let dialed = tokio::time::timeout(
            peer_config.connection_timeout,
            dial(addr, seat_id, peer_config.socket_buffer_size()),
        )
        .await
        .unwrap_or(Err(ClientError::Timeout));

        let (stream, addr) = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Could not connect: {}", e);
                pending.disarm();
                fail_connect(&conn, DisconnectCause::SocketError);
                let _ = self.events.send(ClientEvent::CouldNotConnect { addr: None });
                return Err(e);
            }
        };

        conn.attach(stream);
        pending.disarm();
        if !conn.establish(seat_id) {
            tracing::debug!("Connect to {} cancelled", addr);
            fail_connect(&conn, DisconnectCause::Requested);
            let _ = self
                .events
                .send(ClientEvent::CouldNotConnect { addr: Some(addr) });
            return Err(ClientError::Cancelled);
        }

        let driver = tokio::spawn(drive(conn.clone(), self.events.clone()));
        if let Some(session) = self.session.lock().as_mut() {
            if Arc::ptr_eq(&session.conn, &conn) {
                session.driver = Some(driver);
            }
        }

        tracing::info!("Connected to {} as seat {}", addr, seat_id);
        let _ = self.events.send(ClientEvent::Connected { addr });
        Ok(())
    }

    /// Requests teardown; completed by the driver on its next tick.
    ///
    /// Returns `false` if there was nothing to disconnect.
    pub fn disconnect(&self) -> bool {
        match self.connection() {
            Some(conn) => conn.disconnect(DisconnectCause::Requested),
            None => false,
        }
    }

    /// Disconnects and waits until teardown has completed.
    pub async fn close(&self) {
        self.disconnect();
        let driver = self.session.lock().as_mut().and_then(|s| s.driver.take());
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }

    /// Queues a typed message to the server.
    pub fn send_message<T: Message>(&self, msg: &T) -> Result<(), ClientError> {
        match self.live_connection() {
            Some(conn) => Ok(conn.send(msg)?),
            None if self.config.lock().peer.fail_on_send_while_disconnected => {
                Err(ClientError::NotConnected)
            }
            None => Ok(()),
        }
    }

    /// Calls `endpoint` on the server and waits for the response.
    pub async fn request(
        &self,
        endpoint: &str,
        body: impl Into<String>,
    ) -> Result<Reply, ClientError> {
        let Some(conn) = self.live_connection() else {
            return self.request_without_connection();
        };
        Ok(conn.request(endpoint, body).await?)
    }

    /// Like [`Client::request`] with an explicit deadline.
    pub async fn request_with_timeout(
        &self,
        endpoint: &str,
        body: impl Into<String>,
        timeout: Duration,
    ) -> Result<Reply, ClientError> {
        let Some(conn) = self.live_connection() else {
            return self.request_without_connection();
        };
        Ok(conn.request_with_timeout(endpoint, body, timeout).await?)
    }

    /// Like [`Client::request`], with `body` serialized as JSON.
    pub async fn request_json<T: Serialize>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<Reply, ClientError> {
        let body = serde_json::to_string(body)?;
        self.request(endpoint, body).await
    }

    fn request_without_connection(&self) -> Result<Reply, ClientError> {
        if self.config.lock().peer.fail_on_request_while_disconnected {
            Err(ClientError::NotConnected)
        } else {
            Ok(Reply::timeout())
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.conn.disconnect(DisconnectCause::Requested);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("seat_id", &self.seat_id())
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

/// Resolves `addr`, connects and writes the identity header.
async fn dial(
    addr: impl ToSocketAddrs,
    seat_id: PeerId,
    buffer_size: u32,
) -> Result<(TcpStream, SocketAddr), ClientError> {
    let mut last_err = None;
    for addr in lookup_host(addr).await? {
        match connect_socket(addr, buffer_size).await {
            Ok(mut stream) => {
                stream.write_all(&encode_handshake(seat_id)).await?;
                return Ok((stream, addr));
            }
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => ClientError::Io(e),
        None => ClientError::NoAddress,
    })
}

async fn connect_socket(addr: SocketAddr, buffer_size: u32) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    socket.connect(addr).await
}

/// Settles a connection that never reached `Connected`.
fn fail_connect(conn: &Arc<Connection>, cause: DisconnectCause) {
    if !conn.abort(cause) {
        // A concurrent disconnect already moved it to Disconnecting.
        let _ = conn.tick();
    }
}

/// Aborts a connection left in `Connecting` when dropped while armed.
struct ConnectGuard(Option<Arc<Connection>>);

impl ConnectGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            tracing::debug!("Connect abandoned before completion");
            fail_connect(&conn, DisconnectCause::Requested);
        }
    }
}

async fn drive(conn: Arc<Connection>, events: broadcast::Sender<ClientEvent>) {
    let mut interval = tokio::time::interval(conn.config().tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let TickOutcome::Closed(cause) = conn.tick() {
            tracing::info!("Disconnected: {}", cause);
            let _ = events.send(ClientEvent::Disconnected { cause });
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easycom_core::PeerConfig;
    use easycom_protocol::decode_handshake;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config() -> ClientConfig {
        ClientConfig::new().with_peer(
            PeerConfig::default()
                .with_tick_interval(Duration::from_millis(5))
                .with_connection_timeout(Duration::from_millis(500)),
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_writes_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Client::new(test_config().with_seat_id(-7));
        let mut events = client.subscribe();
        client.connect(addr).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected { addr });

        let (mut accepted, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 2];
        accepted.read_exact(&mut header).await.unwrap();
        assert_eq!(decode_handshake(header), -7);

        assert!(matches!(
            client.connect(addr).await,
            Err(ClientError::AlreadyConnected(ConnectionState::Connected))
        ));
    }

    #[tokio::test]
    async fn test_refused_connect_emits_could_not_connect() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let client = Client::new(test_config());
        let mut events = client.subscribe();
        assert!(client.connect(addr).await.is_err());
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::CouldNotConnect { addr: None }
        );
        assert_eq!(client.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_server_close_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Client::new(test_config());
        let mut events = client.subscribe();
        client.connect(addr).await.unwrap();
        next_event(&mut events).await;

        let (accepted, _) = listener.accept().await.unwrap();
        drop(accepted);

        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Disconnected {
                cause: DisconnectCause::RemoteClosed
            }
        );
        assert_eq!(client.state(), ConnectionState::NotConnected);

        // The client can reconnect once the previous session settled.
        client.connect(addr).await.unwrap();
        client.close().await;
        assert_eq!(client.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_abandoned_connect_settles_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Client::new(test_config());

        // Name resolution runs on the blocking pool, so the first poll
        // leaves the connect in progress.
        let mut connect = tokio_test::task::spawn(client.connect(("localhost", addr.port())));
        assert!(connect.poll().is_pending());
        assert_eq!(client.state(), ConnectionState::Connecting);

        drop(connect);
        assert_eq!(client.state(), ConnectionState::NotConnected);

        client.connect(addr).await.unwrap();
        assert!(client.is_connected());
        client.close().await;
    }

    #[tokio::test]
    async fn test_not_connected_behavior() {
        let client = Client::new(test_config());
        assert!(!client.disconnect());
        assert!(matches!(
            client.request("echo", "").await,
            Err(ClientError::NotConnected)
        ));

        let lenient = Client::new(test_config().with_peer(
            PeerConfig::default()
                .with_fail_on_request_while_disconnected(false)
                .with_fail_on_send_while_disconnected(false),
        ));
        assert!(lenient.request("echo", "").await.unwrap().is_timeout());
        assert!(lenient
            .send_message(&easycom_protocol::ResponseMsg {
                request_id: 0,
                status: 0,
                payload: String::new(),
            })
            .is_ok());
    }

    #[test]
    fn test_request_without_session() {
        let client = Client::new(ClientConfig::default());
        let result = tokio_test::block_on(client.request("echo", "body"));
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(client.state(), ConnectionState::NotConnected);
    }

    #[test]
    fn test_set_seat_id() {
        let client = Client::new(ClientConfig::default());
        assert_eq!(client.seat_id(), 0);
        client.set_seat_id(42);
        assert_eq!(client.seat_id(), 42);
    }
}
