//! # easycom-client
//!
//! Client library for easycom.
//!
//! This crate provides:
//! - TCP connect with a timeout followed by the identity handshake
//! - A background driver that reads, dispatches and flushes the connection
//! - Correlated requests and typed fire-and-forget messages
//! - Endpoints and message handlers the server can call into

pub mod client;
pub mod config;
pub mod error;
pub mod events;

pub use client::Client;
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::ClientEvent;

pub use easycom_core::{ConnectionState, DisconnectCause, PeerConfig, Responder};
pub use easycom_protocol::{Message, PeerId, Reply};
