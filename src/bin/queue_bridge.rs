//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Command line entry point for the queue bridge.
//
// | Command    | Description                                                           |
// |------------|-----------------------------------------------------------------------|
// | subscribe  | Listen on the queue server's socket and log every message until Ctrl+C |
// | publish    | Send one event with a JSON payload to the publish endpoint            |
//
// Configuration is read from the environment (or a .env file):
//   GO_QUEUE_WS_URL, GO_QUEUE_URL, GO_QUEUE_REQUEST_TIMEOUT_MS,
//   GO_QUEUE_MAX_RECONNECT_ATTEMPTS, GO_QUEUE_BACKOFF_INITIAL_MS,
//   GO_QUEUE_BACKOFF_MAX_MS, GO_QUEUE_BACKOFF_MULTIPLIER
//--------------------------------------------------------------------------------------------------
// cargo run --bin queue_bridge -- subscribe
// cargo run --bin queue_bridge -- publish order.created '{"id": 42}'
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use queue_bridge::{
    BridgeConfig, BridgeError, CancellationToken, LoggingHandler, Publisher, Subscriber,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bridge between a websocket queue subscription and an HTTP publish endpoint")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to the queue server and log every inbound message
    Subscribe,
    /// Publish a single event
    Publish {
        /// Event name, e.g. order.created
        event: String,
        /// Payload as JSON text
        #[arg(default_value = "null")]
        data: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = BridgeConfig::try_from_env()?;

    match cli.command {
        Command::Subscribe => subscribe(&config).await,
        Command::Publish { event, data } => publish(&config, &event, &data).await,
    }
}

async fn subscribe(config: &BridgeConfig) -> Result<ExitCode> {
    let mut subscriber = Subscriber::websocket(config, LoggingHandler);
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping...");
        }
        token.cancel();
    });

    match subscriber.run(shutdown).await {
        Ok(()) => {
            let stats = subscriber.stats();
            info!(
                "Handled {} messages ({} handler failures, {} skipped) over {} connections",
                stats.dispatched, stats.handler_failures, stats.skipped, stats.connections
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(BridgeError::SubscriptionLost { attempts }) => {
            error!("Subscription lost after {} reconnect attempts", attempts);
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

async fn publish(config: &BridgeConfig, event: &str, data: &str) -> Result<ExitCode> {
    let payload: serde_json::Value =
        serde_json::from_str(data).with_context(|| format!("payload is not valid JSON: {}", data))?;

    let publisher = Publisher::new(config)?;
    if publisher.publish(event, &payload).await? {
        info!("Published '{}' to {}", event, publisher.publish_url());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
