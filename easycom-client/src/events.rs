//! Client connection events.

use easycom_core::DisconnectCause;
use easycom_protocol::Reply;
use std::net::SocketAddr;

/// Something that happened to the client's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The handshake was written and the connection is live.
    Connected { addr: SocketAddr },
    /// A live connection was torn down.
    Disconnected { cause: DisconnectCause },
    /// A connection attempt failed before the handshake completed.
    CouldNotConnect { addr: Option<SocketAddr> },
    /// A response arrived for a request that was no longer pending.
    OutdatedResponse { reply: Reply },
}
