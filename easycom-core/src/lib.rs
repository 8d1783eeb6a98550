//! # easycom-core
//!
//! Role-neutral connection engine shared by the easycom client and server.
//!
//! A [`Connection`] owns one socket and is driven by periodic calls to
//! [`Connection::tick`], which drains inbound frames into the
//! [`Dispatcher`] and flushes queued outbound frames. Requests suspend on
//! the per-connection [`RequestCorrelator`] until a response, a timeout or
//! a disconnect resolves them.

pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod lifecycle;

pub use config::PeerConfig;
pub use connection::{Connection, TickOutcome};
pub use correlator::{RequestCorrelator, MAX_PENDING};
pub use dispatch::{Dispatcher, Responder};
pub use error::CoreError;
pub use lifecycle::{ConnectionState, DisconnectCause, Lifecycle};

pub use easycom_protocol::{Message, PeerId, Reply};
