//! Command execution.

use crate::Commands;
use colored::Colorize;
use easycom_client::{Client, Reply};
use easycom_protocol::message::{STATUS_OK, STATUS_RELEASED, STATUS_TIMEOUT};
use serde_json::Value;
use std::time::Instant;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Ping { count } => {
            let mut output = String::new();
            for seq in 0..count.max(1) {
                output.push_str(&ping(client, seq).await?);
                output.push('\n');
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Request {
            endpoint,
            body,
            json,
        } => {
            let body = read_body_arg(&body)?;
            let reply = client.request(&endpoint, body).await?;
            Ok(format_reply(&reply, json))
        }
    }
}

/// Sends one request to the `ping` endpoint and reports the round trip.
pub async fn ping(client: &Client, seq: u32) -> Result<String, Box<dyn std::error::Error>> {
    let started = Instant::now();
    let reply = client.request("ping", seq.to_string()).await?;
    let elapsed = started.elapsed();

    if reply.is_ok() {
        Ok(format!(
            "{} seq={} time={:.2} ms",
            "PONG".green(),
            seq,
            elapsed.as_secs_f64() * 1000.0
        ))
    } else {
        Ok(format!("{} seq={}", status_label(reply.status), seq))
    }
}

/// Formats a reply as a status line followed by the payload.
pub fn format_reply(reply: &Reply, pretty_json: bool) -> String {
    let payload = if pretty_json {
        match serde_json::from_str::<Value>(&reply.payload) {
            Ok(value) => format_json(&value),
            Err(_) => reply.payload.clone(),
        }
    } else {
        reply.payload.clone()
    };

    if payload.is_empty() {
        status_label(reply.status)
    } else {
        format!("{}\n{}", status_label(reply.status), payload)
    }
}

fn status_label(status: u8) -> String {
    match status {
        STATUS_OK => "OK".green().to_string(),
        STATUS_RELEASED => "RELEASED (connection closed)".yellow().to_string(),
        STATUS_TIMEOUT => "TIMEOUT".red().to_string(),
        other => format!("STATUS {}", other).yellow().to_string(),
    }
}

/// Reads a body argument (either inline text or @file).
pub fn read_body_arg(arg: &str) -> Result<String, Box<dyn std::error::Error>> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => Ok(arg.to_string()),
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
