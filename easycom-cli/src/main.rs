//! easycom-cli - Command-line client for easycom servers
//!
//! Provides both a REPL and one-shot requests.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use easycom_client::{Client, ClientConfig, PeerConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "easycom-cli")]
#[command(about = "Command-line client for easycom servers")]
#[command(version)]
struct Cli {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7500", env = "EASYCOM_SERVER")]
    server: String,

    /// Identity sent in the handshake (used by seat admission)
    #[arg(long, default_value = "0", env = "EASYCOM_SEAT", allow_negative_numbers = true)]
    seat: i16,

    /// Request timeout in milliseconds
    #[arg(short, long, default_value = "10000")]
    timeout: u64,

    /// Connection timeout in milliseconds
    #[arg(long, default_value = "5000")]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Measure the round trip of a request to the `ping` endpoint
    Ping {
        /// Number of requests to send
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Call an endpoint and print its response
    Request {
        /// Endpoint name
        endpoint: String,

        /// Request body (or @file to read from file)
        #[arg(default_value = "")]
        body: String,

        /// Pretty-print the response payload as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let peer = PeerConfig::default()
        .with_request_timeout(Duration::from_millis(cli.timeout))
        .with_connection_timeout(Duration::from_millis(cli.connect_timeout));
    let client = Client::new(ClientConfig::new().with_seat_id(cli.seat).with_peer(peer));

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &cli.server).await?;
        }
        Some(cmd) => {
            client.connect(cli.server.as_str()).await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, cmd).await;
            client.close().await;

            match result {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
