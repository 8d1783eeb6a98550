//! Client configuration.

use easycom_core::PeerConfig;
use easycom_protocol::PeerId;

/// Default capacity of the client event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity sent in the handshake. Only meaningful to servers that use
    /// seat admission.
    pub seat_id: PeerId,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Transport settings.
    pub peer: PeerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seat_id: 0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            peer: PeerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seat_id(mut self, seat_id: PeerId) -> Self {
        self.seat_id = seat_id;
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
