//! Server connection events.

use easycom_core::DisconnectCause;
use easycom_protocol::{PeerId, Reply};
use std::net::SocketAddr;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something that happened to a peer connection.
///
/// Delivered on a broadcast channel; receivers that fall behind lose the
/// oldest events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A peer completed the handshake.
    ClientConnected { peer: PeerId, addr: SocketAddr },
    /// A connected peer was torn down.
    ClientDisconnected { peer: PeerId, cause: DisconnectCause },
    /// Seat admission refused a peer that claimed an unreserved identity.
    UnexpectedClient { peer: PeerId },
    /// A peer claimed an identity that is already connected.
    DuplicateConnection { peer: PeerId },
    /// A socket was closed before admission.
    ConnectionRejected {
        addr: SocketAddr,
        cause: DisconnectCause,
    },
    /// A response arrived for a request that was no longer pending.
    OutdatedResponse { peer: PeerId, reply: Reply },
    /// A request the server sent to a peer timed out.
    RequestTimedOut { peer: PeerId, endpoint: String },
}
