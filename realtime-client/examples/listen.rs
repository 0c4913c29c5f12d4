//! Print inbound payloads and send stdin lines as payloads.
//!
//! ```sh
//! cargo run -p realtime-client --example listen -- ws://localhost:8000/ws
//! ```
//!
//! Or via environment variable:
//! ```sh
//! WS_URL=wss://chat.example.com/ws cargo run -p realtime-client --example listen
//! ```
//!
//! A stdin line holding a JSON object is sent as is; any other line is sent as
//! `{"type":"chat","body":<line>}`. Payloads are printed to stdout (pipe to
//! `jq` for formatting), connection state to stderr.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use realtime_client::{Client, ClientConfig, Payload, ReconnectPolicy};

#[derive(Parser)]
#[command(name = "listen")]
struct Cli {
    /// WebSocket endpoint
    #[arg(env = "WS_URL", default_value = realtime_client::DEFAULT_URL)]
    url: String,
    /// Delay before the first reconnect, in milliseconds
    #[arg(long, default_value_t = 1000)]
    base_delay_ms: u64,
    /// Reconnect attempts before giving up
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
}

fn to_payload(line: &str) -> Payload {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| Payload::try_from(value).ok())
        .unwrap_or_else(|| Payload::of_type("chat").with("body", line))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig {
        reconnect: ReconnectPolicy::new(Duration::from_millis(cli.base_delay_ms), cli.max_attempts),
        ..ClientConfig::new(cli.url)
    };

    let client = match Client::start(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _sub = client.subscribe(|payload| match payload.encode() {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("[unprintable] {e}"),
    });

    let mut changes = client.state_changes();
    tokio::spawn(async move {
        while let Some(state) = changes.next().await {
            eprintln!("[{state}]");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if !client.send(&to_payload(&line)) {
                        eprintln!("[not sent: {}]", client.status());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    eprintln!("error: reading stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    ExitCode::SUCCESS
}
