//! easycom - demo server
//!
//! Serves a few endpoints over the easycom protocol until Ctrl-C.

use easycom_server::{Config, Message, Server, ServerEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Chat line relayed to every connected peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatLine {
    from: i16,
    text: String,
}

impl Message for ChatLine {
    const NAME: &'static str = "ChatLine";
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if EASYCOM_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("EASYCOM_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting easycom server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Seat admission: {}",
        if config.network.seat_admission { "enabled" } else { "disabled" }
    );

    let server = Arc::new(Server::new(config.server_config()));
    register_demo_handlers(&server)?;

    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::OutdatedResponse { peer, reply } => {
                    tracing::debug!("[peer {}] Late response with status {}", peer, reply.status)
                }
                ServerEvent::RequestTimedOut { peer, endpoint } => {
                    tracing::warn!("[peer {}] Request to {} timed out", peer, endpoint)
                }
                other => tracing::debug!("Event: {:?}", other),
            }
        }
    });

    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    server.stop().await?;

    Ok(())
}

fn register_demo_handlers(server: &Arc<Server>) -> Result<(), easycom_server::ServerError> {
    server.register_endpoint("echo", |_, body, responder| responder.ok(body))?;
    server.register_endpoint("ping", |_, _, responder| responder.ok("pong"))?;
    server.register_endpoint("whoami", |peer, _, responder| {
        responder.ok(peer.to_string())
    })?;

    let weak = Arc::downgrade(server);
    server.register_endpoint("peers", move |_, _, responder| {
        let peers = weak
            .upgrade()
            .map(|server| server.connected_peers())
            .unwrap_or_default();
        match serde_json::to_string(&peers) {
            Ok(json) => responder.ok(json),
            Err(e) => responder.respond(1, e.to_string()),
        }
    })?;

    let weak = Arc::downgrade(server);
    server.register_message_handler(move |peer, line: ChatLine| {
        let Some(server) = weak.upgrade() else {
            return;
        };
        let relayed = ChatLine {
            from: peer,
            text: line.text,
        };
        let delivered = server.broadcast_message(&relayed);
        tracing::debug!("[peer {}] Relayed chat line to {} peers", peer, delivered);
    })?;

    Ok(())
}
