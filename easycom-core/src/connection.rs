//! Transport connection.
//!
//! One [`Connection`] owns one socket, its receive buffer and its outbound
//! queue. Nothing here awaits on the socket: a driver calls
//! [`Connection::tick`] periodically, which reads whatever is available,
//! dispatches complete frames in arrival order and flushes queued frames
//! in FIFO order.

use crate::config::PeerConfig;
use crate::correlator::RequestCorrelator;
use crate::dispatch::Dispatcher;
use crate::error::CoreError;
use crate::lifecycle::{ConnectionState, DisconnectCause, Lifecycle};
use bytes::{Buf, Bytes};
use easycom_protocol::{CommandMsg, Frame, FrameDecoder, Message, PeerId, ProtocolError, Reply};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Result of one driver tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The connection stays registered with its driver.
    Open,
    /// The connection reached `NotConnected` and should be dropped.
    Closed(DisconnectCause),
}

/// Frames waiting to be written, with their total size.
#[derive(Default)]
struct Outbound {
    frames: VecDeque<Bytes>,
    bytes: usize,
}

/// One peer-to-peer channel.
pub struct Connection {
    peer: AtomicI16,
    remote_addr: Mutex<Option<SocketAddr>>,
    lifecycle: Lifecycle,
    stream: Mutex<Option<TcpStream>>,
    decoder: Mutex<FrameDecoder>,
    outbound: Mutex<Outbound>,
    correlator: RequestCorrelator,
    dispatcher: Arc<Dispatcher>,
    config: PeerConfig,
}

impl Connection {
    pub fn new(dispatcher: Arc<Dispatcher>, config: PeerConfig) -> Arc<Self> {
        Arc::new(Self {
            peer: AtomicI16::new(0),
            remote_addr: Mutex::new(None),
            lifecycle: Lifecycle::new(),
            stream: Mutex::new(None),
            decoder: Mutex::new(FrameDecoder::with_capacity(config.buffer_capacity)),
            outbound: Mutex::new(Outbound::default()),
            correlator: RequestCorrelator::new(),
            dispatcher,
            config,
        })
    }

    pub fn peer(&self) -> PeerId {
        self.peer.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    /// Number of frames waiting to be flushed.
    pub fn queued_frames(&self) -> usize {
        self.outbound.lock().frames.len()
    }

    /// Number of bytes waiting to be flushed.
    pub fn queued_bytes(&self) -> usize {
        self.outbound.lock().bytes
    }

    /// `NotConnected -> Connecting`.
    pub fn begin_connect(&self) -> Result<(), CoreError> {
        self.lifecycle.begin_connect().map_err(CoreError::InvalidState)
    }

    /// Hands the socket to the connection.
    pub fn attach(&self, stream: TcpStream) {
        stream.set_nodelay(true).ok();
        *self.remote_addr.lock() = stream.peer_addr().ok();
        *self.stream.lock() = Some(stream);
    }

    /// `Connecting -> Connected` under identity `peer`.
    pub fn establish(&self, peer: PeerId) -> bool {
        self.peer.store(peer, Ordering::Release);
        self.lifecycle.establish()
    }

    /// Abandons a connection that never became connected.
    pub fn abort(&self, cause: DisconnectCause) -> bool {
        if !self.lifecycle.abort(cause) {
            return false;
        }
        self.stream.lock().take();
        true
    }

    /// Requests teardown; completed on the next tick. Idempotent.
    pub fn disconnect(&self, cause: DisconnectCause) -> bool {
        let started = self.lifecycle.begin_disconnect(cause);
        if started {
            tracing::debug!("[peer {}] Disconnecting: {}", self.peer(), cause);
        }
        started
    }

    /// Queues a message for the next flush.
    pub fn send<T: Message>(&self, msg: &T) -> Result<(), CoreError> {
        if !self.lifecycle.is_connected() {
            if self.config.fail_on_send_while_disconnected {
                return Err(CoreError::NotConnected);
            }
            tracing::debug!("[peer {}] Dropping {}: not connected", self.peer(), T::NAME);
            return Ok(());
        }

        self.enqueue(self.dispatcher.registry().encode(msg)?.freeze())
    }

    fn enqueue(&self, frame: Bytes) -> Result<(), CoreError> {
        if frame.len() > self.config.buffer_capacity {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.config.buffer_capacity,
            }
            .into());
        }

        let max = self.config.outbound_limit();
        let mut outbound = self.outbound.lock();
        if outbound.bytes + frame.len() > max {
            tracing::warn!(
                "[peer {}] Outbound queue full ({} bytes), peer is not reading",
                self.peer(),
                outbound.bytes
            );
            return Err(CoreError::OutboundFull {
                queued: outbound.bytes,
                max,
            });
        }
        outbound.bytes += frame.len();
        outbound.frames.push_back(frame);
        Ok(())
    }

    /// Issues a request with the configured timeout.
    pub async fn request(&self, endpoint: &str, body: impl Into<String>) -> Result<Reply, CoreError> {
        self.request_with_timeout(endpoint, body, self.config.request_timeout)
            .await
    }

    /// Sends a command to `endpoint` and waits for its response.
    ///
    /// Timeouts and disconnects resolve as replies with status 255 and 254.
    /// An error is returned only for misuse: issuing a request while not
    /// connected (if so configured) or a body that cannot be framed.
    pub async fn request_with_timeout(
        &self,
        endpoint: &str,
        body: impl Into<String>,
        timeout: Duration,
    ) -> Result<Reply, CoreError> {
        if !self.lifecycle.is_connected() {
            if self.config.fail_on_request_while_disconnected {
                return Err(CoreError::NotConnected);
            }
            return Ok(Reply::timeout());
        }

        let (request_id, rx) = match self.correlator.register() {
            Ok(registered) => registered,
            Err(CoreError::TooManyPending(max)) => {
                tracing::warn!(
                    "[peer {}] {} requests pending, failing request to {}",
                    self.peer(),
                    max,
                    endpoint
                );
                return Ok(Reply::timeout());
            }
            Err(e) => return Err(e),
        };

        let command = CommandMsg {
            request_id,
            endpoint_hash: self.dispatcher.endpoint_hash(endpoint),
            payload: body.into(),
        };
        let queued = self
            .dispatcher
            .registry()
            .encode(&command)
            .map_err(CoreError::from)
            .and_then(|frame| self.enqueue(frame.freeze()));
        if let Err(e) = queued {
            self.correlator.cancel(request_id);
            return Err(e);
        }

        // Teardown may have released the table before our entry went in.
        if !self.lifecycle.is_connected() && self.correlator.cancel(request_id) {
            return Ok(Reply::released());
        }

        tracing::debug!(
            "[peer {}] Request id={} to {} queued",
            self.peer(),
            request_id,
            endpoint
        );
        Ok(self.correlator.wait(request_id, rx, timeout).await)
    }

    /// Runs one read/dispatch/flush cycle, or completes a pending teardown.
    pub fn tick(self: &Arc<Self>) -> TickOutcome {
        match self.lifecycle.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => return TickOutcome::Open,
            ConnectionState::Disconnecting => return TickOutcome::Closed(self.teardown()),
            ConnectionState::NotConnected => {
                let cause = self.lifecycle.cause().unwrap_or(DisconnectCause::Requested);
                return TickOutcome::Closed(cause);
            }
        }

        let (frames, read_failure) = self.read_frames();
        for frame in frames {
            if !self.lifecycle.is_connected() {
                break;
            }
            if let Err(e) = self.dispatcher.dispatch(self, frame) {
                tracing::warn!("[peer {}] Invalid message: {}", self.peer(), e);
                self.disconnect(DisconnectCause::InvalidMessage);
            }
        }

        if let Some(cause) = read_failure {
            self.disconnect(cause);
        }
        if let Err(cause) = self.flush() {
            self.disconnect(cause);
        }
        TickOutcome::Open
    }

    /// Reads what the socket has, bounded by one buffer capacity per tick,
    /// and splits off every complete frame.
    fn read_frames(&self) -> (Vec<Frame>, Option<DisconnectCause>) {
        let stream = self.stream.lock();
        let Some(stream) = stream.as_ref() else {
            return (Vec::new(), Some(DisconnectCause::SocketError));
        };

        let mut decoder = self.decoder.lock();
        let chunk = self.config.read_chunk();
        let mut budget = self.config.buffer_capacity;
        let mut failure = None;

        while budget > 0 {
            match stream.try_read_buf(decoder.read_buf(chunk)) {
                Ok(0) => {
                    failure = Some(DisconnectCause::RemoteClosed);
                    break;
                }
                Ok(n) => budget = budget.saturating_sub(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("[peer {}] Read error: {}", self.peer(), e);
                    failure = Some(DisconnectCause::SocketError);
                    break;
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("[peer {}] Malformed frame: {}", self.peer(), e);
                    failure = Some(DisconnectCause::InvalidMessage);
                    break;
                }
            }
        }

        (frames, failure)
    }

    /// Writes queued frames until the queue is empty or the socket is full.
    fn flush(&self) -> Result<(), DisconnectCause> {
        let stream = self.stream.lock();
        let Some(stream) = stream.as_ref() else {
            return Ok(());
        };

        let mut outbound = self.outbound.lock();
        let Outbound { frames, bytes } = &mut *outbound;
        while let Some(front) = frames.front_mut() {
            match stream.try_write(front) {
                Ok(0) => return Err(DisconnectCause::SocketError),
                Ok(n) => {
                    front.advance(n);
                    *bytes -= n;
                    if front.is_empty() {
                        frames.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("[peer {}] Write error: {}", self.peer(), e);
                    return Err(DisconnectCause::SocketError);
                }
            }
        }
        Ok(())
    }

    /// `Disconnecting -> NotConnected`: releases pending requests, closes
    /// the socket and reports the recorded cause.
    fn teardown(&self) -> DisconnectCause {
        let released = self.correlator.release_all();
        let _ = self.flush();
        self.stream.lock().take();
        *self.outbound.lock() = Outbound::default();
        self.decoder.lock().clear();

        let cause = self.lifecycle.settle().unwrap_or(DisconnectCause::Requested);
        tracing::debug!(
            "[peer {}] Closed ({}), released {} pending requests",
            self.peer(),
            cause,
            released
        );
        cause
    }

    #[cfg(test)]
    pub(crate) fn drain_outbound(&self) -> Vec<Bytes> {
        let mut outbound = self.outbound.lock();
        outbound.bytes = 0;
        outbound.frames.drain(..).collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer())
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .field("pending", &self.pending_requests())
            .finish()
    }
}
