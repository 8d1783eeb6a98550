//! Connection lifecycle state machine.
//!
//! ```text
//! NotConnected -> Connecting -> Connected -> Disconnecting -> NotConnected
//!                     |                                           ^
//!                     +------------- abort (handshake failed) ----+
//! ```

use parking_lot::Mutex;
use std::fmt;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Idle, or torn down.
    #[default]
    NotConnected,
    /// Socket open, handshake in progress.
    Connecting,
    /// Handshake complete, frames flow.
    Connected,
    /// Teardown requested, completed on the next driver tick.
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::NotConnected => "not connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Disconnect requested by the local side.
    Requested,
    /// The server is stopping.
    Shutdown,
    /// The remote peer closed the stream.
    RemoteClosed,
    /// Reading or writing the socket failed.
    SocketError,
    /// Handshake was malformed or did not arrive in time.
    InvalidHandshake,
    /// A frame could not be decoded or routed.
    InvalidMessage,
    /// Seat admission is on and the presented identity was not reserved.
    UnexpectedIdentity,
    /// The presented identity is already connected.
    DuplicateIdentity,
    /// No free identity was available.
    ServerFull,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectCause::Requested => "disconnect requested",
            DisconnectCause::Shutdown => "server shutdown",
            DisconnectCause::RemoteClosed => "closed by remote peer",
            DisconnectCause::SocketError => "socket error",
            DisconnectCause::InvalidHandshake => "invalid handshake",
            DisconnectCause::InvalidMessage => "invalid message",
            DisconnectCause::UnexpectedIdentity => "unexpected identity",
            DisconnectCause::DuplicateIdentity => "duplicate identity",
            DisconnectCause::ServerFull => "server full",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: ConnectionState,
    cause: Option<DisconnectCause>,
}

/// Thread-safe lifecycle cell.
///
/// Every transition is a compare-and-set on the current state, so racing
/// callers observe exactly one winner.
#[derive(Debug, Default)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Cause recorded by the most recent disconnect or abort.
    pub fn cause(&self) -> Option<DisconnectCause> {
        self.inner.lock().cause
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// `NotConnected -> Connecting`. Returns the blocking state on refusal.
    pub fn begin_connect(&self) -> Result<(), ConnectionState> {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::NotConnected => {
                inner.state = ConnectionState::Connecting;
                inner.cause = None;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// `Connecting -> Connected`.
    pub fn establish(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// `Connecting | Connected -> Disconnecting`.
    ///
    /// Returns `false` if the connection was already disconnecting or idle.
    /// The first recorded cause wins.
    pub fn begin_disconnect(&self, cause: DisconnectCause) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                inner.state = ConnectionState::Disconnecting;
                inner.cause = Some(cause);
                true
            }
            ConnectionState::Disconnecting | ConnectionState::NotConnected => false,
        }
    }

    /// `Connecting -> NotConnected`, skipping `Disconnecting`.
    pub fn abort(&self, cause: DisconnectCause) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::NotConnected;
            inner.cause = Some(cause);
            true
        } else {
            false
        }
    }

    /// `Disconnecting -> NotConnected`. Returns the recorded cause.
    pub fn settle(&self) -> Option<DisconnectCause> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Disconnecting {
            inner.state = ConnectionState::NotConnected;
            inner.cause
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ConnectionState::NotConnected);

        lifecycle.begin_connect().unwrap();
        assert!(lifecycle.establish());
        assert!(lifecycle.is_connected());

        assert!(lifecycle.begin_disconnect(DisconnectCause::RemoteClosed));
        assert_eq!(lifecycle.state(), ConnectionState::Disconnecting);

        assert_eq!(lifecycle.settle(), Some(DisconnectCause::RemoteClosed));
        assert_eq!(lifecycle.state(), ConnectionState::NotConnected);
    }

    #[test]
    fn test_connect_rejected_while_active() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_connect().unwrap();
        assert_eq!(lifecycle.begin_connect(), Err(ConnectionState::Connecting));

        lifecycle.establish();
        assert_eq!(lifecycle.begin_connect(), Err(ConnectionState::Connected));

        lifecycle.begin_disconnect(DisconnectCause::Requested);
        assert_eq!(lifecycle.begin_connect(), Err(ConnectionState::Disconnecting));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_connect().unwrap();
        lifecycle.establish();

        assert!(lifecycle.begin_disconnect(DisconnectCause::Requested));
        assert!(!lifecycle.begin_disconnect(DisconnectCause::SocketError));
        assert_eq!(lifecycle.cause(), Some(DisconnectCause::Requested));
    }

    #[test]
    fn test_abort_skips_disconnecting() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_connect().unwrap();
        assert!(lifecycle.abort(DisconnectCause::InvalidHandshake));
        assert_eq!(lifecycle.state(), ConnectionState::NotConnected);
        assert_eq!(lifecycle.settle(), None);

        // A fresh attempt clears the previous cause.
        lifecycle.begin_connect().unwrap();
        assert_eq!(lifecycle.cause(), None);
    }

    #[test]
    fn test_abort_only_from_connecting() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.abort(DisconnectCause::InvalidHandshake));
        lifecycle.begin_connect().unwrap();
        lifecycle.establish();
        assert!(!lifecycle.abort(DisconnectCause::InvalidHandshake));
        assert!(lifecycle.is_connected());
    }
}
