//! gattlink-cli: talk to a GATT text peripheral from the terminal
//!
//! Run with:
//!   cd packages/gattlink_cli && RUST_LOG=debug cargo run -- run --name ESP32 --reconnect immediate

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gattlink::ble::central::BtleplugTransport;
use gattlink::{find_and_connect, BleError, ClientConfig, ClientEvent, LinkState, ReconnectPolicy};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "gattlink-cli", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the peripheral, print its messages and send stdin lines to it
    Run {
        /// JSON config file; flags below override its fields
        #[arg(long)]
        config: Option<PathBuf>,

        /// Advertised name to connect to
        #[arg(long)]
        name: Option<String>,

        /// none | immediate | backoff(base, max, factor)
        #[arg(long)]
        reconnect: Option<ReconnectPolicy>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            name,
            reconnect,
        } => {
            let mut config = match config {
                Some(path) => ClientConfig::from_json_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ClientConfig::default(),
            };
            if let Some(name) = name {
                config.device_name = name;
            }
            if let Some(policy) = reconnect {
                config.reconnect = policy;
            }
            run(config).await
        }
    }
}

async fn run(config: ClientConfig) -> Result<()> {
    let transport = BtleplugTransport::new()
        .await
        .context("opening Bluetooth adapter")?;
    let (client, peripheral) = find_and_connect(transport, config.clone())
        .await
        .with_context(|| format!("finding {:?}", config.device_name))?;
    println!(
        "Connecting to {} at {} (reconnect: {})",
        config.device_name, peripheral.address, config.reconnect
    );

    let mut events = client.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::MessageReceived(msg)) => println!("< {}", msg),
                Ok(ClientEvent::StateChanged(LinkState::Ready)) => println!("Ready. Type a line to send it."),
                Ok(ClientEvent::StateChanged(state)) => log::debug!("State {:?}", state),
                Ok(ClientEvent::Disconnected { .. }) => println!("Disconnected"),
                Ok(ClientEvent::ReconnectScheduled { attempt, delay }) => {
                    println!("Reconnecting (attempt {}) in {:?}", attempt, delay);
                }
                Ok(ClientEvent::Error(e)) => eprintln!("error: {}", e),
                Err(RecvError::Lagged(n)) => log::warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => match client.send_message(&line).await {
                    Ok(pending) => {
                        if let Err(e) = pending.acked().await {
                            eprintln!("write failed: {}", e);
                        }
                    }
                    Err(BleError::NotReady) => eprintln!("not connected yet"),
                    Err(e) => eprintln!("cannot send: {}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await?;
    Ok(())
}
