//! Interactive REPL.

use crate::commands::{format_reply, ping};
use colored::Colorize;
use easycom_client::{Client, ClientEvent};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  ping                          Round trip to the ping endpoint
  call <endpoint> [body]        Call an endpoint and print the response
  json <endpoint> [body]        Like call, pretty-printing a JSON payload
  status                        Show connection state
  reconnect                     Reconnect to the server

  quit, exit                    Exit the REPL
"#;

pub async fn run(client: Client, server: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "easycom CLI".bold().cyan());
    println!("Connecting to {}...", server);

    let mut events = client.subscribe();
    client.connect(server).await?;
    println!("{}", "Connected!".green());

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".easycom_history"))
        .unwrap_or_else(|_| ".easycom_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        // Report anything that happened to the connection since the last prompt.
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Disconnected { cause } = event {
                println!("{}: {}\n", "Disconnected".yellow(), cause);
            }
        }

        let prompt = format!("{} ", "easycom>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, server, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    server: &str,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd.to_lowercase(), rest.trim()),
        None => (line.to_lowercase(), ""),
    };

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => Ok(Some(ping(client, 0).await?)),

        "call" | "c" | "json" | "j" => {
            let (endpoint, body) = match rest.split_once(char::is_whitespace) {
                Some((endpoint, body)) => (endpoint, body.trim()),
                None => (rest, ""),
            };
            if endpoint.is_empty() {
                return Ok(Some(format!("Usage: {} <endpoint> [body]", cmd)));
            }
            let reply = client.request(endpoint, body).await?;
            Ok(Some(format_reply(&reply, cmd.starts_with('j'))))
        }

        "status" => Ok(Some(format!(
            "state: {}\nserver: {}\nseat: {}\npending: {}",
            client.state().to_string().yellow(),
            client
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            client.seat_id(),
            client.pending_requests()
        ))),

        "reconnect" => {
            client.close().await;
            client.connect(server).await?;
            Ok(Some("Connected!".green().to_string()))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
