//! # easycom-server
//!
//! TCP server for easycom.
//!
//! This crate provides:
//! - An accept loop with a bounded number of concurrent connections
//! - Identity handshake with open or seat-based admission
//! - A periodic driver that reads, dispatches and flushes every peer
//! - Requests and messages addressed to individual peers
//! - YAML configuration with environment overrides

pub mod admission;
pub mod config;
pub mod error;
pub mod events;
pub mod server;

pub use admission::{Admission, AdmissionError, MAX_CONNECTIONS_LIMIT};
pub use config::{Config, ConfigError, NetworkConfig, TransportConfig};
pub use error::ServerError;
pub use events::ServerEvent;
pub use server::{Server, ServerConfig, ServerState, ServerStats};

pub use easycom_core::{DisconnectCause, PeerConfig, Responder};
pub use easycom_protocol::{Message, PeerId, Reply};
