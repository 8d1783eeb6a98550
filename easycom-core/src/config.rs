//! Per-side transport settings.

use easycom_protocol::{DEFAULT_BUFFER_CAPACITY, FRAME_HEADER_SIZE};
use std::time::Duration;

/// Default connection establishment timeout (5 s).
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default request timeout (10 s).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default driver tick period (50 ms).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Smallest accepted buffer capacity.
pub const MIN_BUFFER_CAPACITY: usize = 1024;

/// Outbound queue limit, in multiples of the buffer capacity.
pub const OUTBOUND_QUEUE_FACTOR: usize = 8;

/// Transport settings consumed when a session starts.
///
/// Changing a config after a connection was created does not affect that
/// connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Bound on establishing a connection, handshake included.
    pub connection_timeout: Duration,
    /// Default deadline for requests.
    pub request_timeout: Duration,
    /// Period of the driver loop.
    pub tick_interval: Duration,
    /// Receive buffer capacity. Also the largest accepted frame and the
    /// socket send/receive buffer size.
    pub buffer_capacity: usize,
    /// Fail `send_message` while not connected instead of dropping.
    pub fail_on_send_while_disconnected: bool,
    /// Fail `request` while not connected instead of resolving as a timeout.
    pub fail_on_request_while_disconnected: bool,
}

impl PeerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(MIN_BUFFER_CAPACITY);
        self
    }

    pub fn with_fail_on_send_while_disconnected(mut self, fail: bool) -> Self {
        self.fail_on_send_while_disconnected = fail;
        self
    }

    pub fn with_fail_on_request_while_disconnected(mut self, fail: bool) -> Self {
        self.fail_on_request_while_disconnected = fail;
        self
    }

    /// Socket buffer size to request from the OS.
    pub fn socket_buffer_size(&self) -> u32 {
        self.buffer_capacity.min(u32::MAX as usize) as u32
    }

    /// Most bytes that may wait in the outbound queue.
    pub fn outbound_limit(&self) -> usize {
        self.buffer_capacity.saturating_mul(OUTBOUND_QUEUE_FACTOR)
    }

    /// Largest chunk read from the socket in one call.
    pub(crate) fn read_chunk(&self) -> usize {
        self.buffer_capacity.clamp(FRAME_HEADER_SIZE, 64 * 1024)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            fail_on_send_while_disconnected: true,
            fail_on_request_while_disconnected: true,
        }
    }
}
