//! Voice relay console
//!
//! Reads commands from stdin and relays audio into the configured voice
//! channel through the voice bridge.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::{
    audio::{enumerate_devices, SystemSources},
    commands::{device_listing, CommandRouter},
    config::AppConfig,
    connection::{ConnectionManager, Requester},
    error::ResponderError,
    presence::{Responder, SystemWindows, TrackPresence, WindowSource},
    transport::UdpGateway,
};

/// Relay file playback or system audio into a voice channel
#[derive(Parser)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, env = "VOICE_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read commands from stdin until `quit`
    Serve,
    /// List audio endpoints and their indices
    Devices {
        /// Print JSON instead of one line per device
        #[arg(long)]
        json: bool,
    },
    /// List visible window titles
    Windows,
}

/// Prints replies to the terminal
struct ConsoleResponder;

#[async_trait]
impl Responder for ConsoleResponder {
    async fn respond(&self, text: &str, ephemeral: bool) -> Result<(), ResponderError> {
        if ephemeral {
            println!("(only you) {}", text);
        } else {
            println!("{}", text);
        }
        Ok(())
    }

    async fn edit_original(&self, text: &str) -> Result<(), ResponderError> {
        println!("(edited) {}", text);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Devices { json } => devices(json).await,
        Command::Windows => {
            for (handle, title) in SystemWindows.list() {
                println!("{:>10}: {}", handle.0, title);
            }
            Ok(())
        }
    }
}

async fn devices(json: bool) -> Result<()> {
    let devices = enumerate_devices().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        println!("\n=== Available Audio Devices ===");
        println!("{}", device_listing(&devices));
    }
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    tracing::info!("Starting voice relay, bridge at {}", config.voice.bridge_addr);

    let gateway = Arc::new(UdpGateway::new(config.voice.bridge_addr));
    let sources = Arc::new(SystemSources::new(config.clone()));
    let connections = Arc::new(
        ConnectionManager::new(gateway, sources).with_poll_interval(config.voice.ready_poll_interval()),
    );
    let presence = Arc::new(TrackPresence::new(
        Arc::new(SystemWindows),
        config.presence.window(),
        config.presence.poll_interval(),
    ));

    let requester = Requester {
        name: "console".to_string(),
        voice_channel: config.voice.channel.clone().map(Into::into),
    };
    let router = CommandRouter::new(connections, presence, config);
    let responder: Arc<dyn Responder> = Arc::new(ConsoleResponder);

    println!("Commands: join, stream, play <path>, stop, now-playing, devices, disconnect, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut interrupted => {
                tracing::info!("Interrupted");
                None
            }
        };

        let Some(line) = line else {
            break;
        };
        match line.trim() {
            "" => continue,
            "quit" | "exit" => break,
            command => router.dispatch(command, &requester, responder.clone()).await,
        }
    }

    router.shutdown().await;
    tracing::info!("Voice relay stopped");
    Ok(())
}
