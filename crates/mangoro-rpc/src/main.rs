//! Mangoro RPC worker.
//!
//! Serves a set of functions over a `tcp://` or `ipc://` endpoint. The bound
//! endpoint is printed on stdout as `RPC_ENDPOINT=<endpoint>` so a parent
//! process can find the worker when it asked for port 0.

mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mangoro_bridge::{register_builtins, HttpController};
use mangoro_core::{DispatcherConfig, Endpoint, Registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mangoro-rpc")]
#[command(about = "Columnar RPC worker for Mangoro")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Requests handled at the same time
    #[arg(long, global = true, default_value_t = DispatcherConfig::DEFAULT_MAX_IN_FLIGHT)]
    max_in_flight: usize,

    /// Seconds in-flight requests get to finish on shutdown
    #[arg(long, global = true, default_value_t = DispatcherConfig::DEFAULT_SHUTDOWN_GRACE.as_secs())]
    grace_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve add, echoString and transposeMatrix
    Example {
        /// Endpoint to listen on, e.g. ipc:///tmp/worker.sock or tcp://127.0.0.1:0
        endpoint: String,
    },
    /// Serve startServer, stopServer and serverStatus
    HttpBridge { endpoint: String },
    /// Reply to every message with its own bytes
    Echo { endpoint: String },
}

fn init_logging(debug: bool, json: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    raw.parse::<Endpoint>()
        .with_context(|| format!("invalid endpoint {:?}", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    let config = DispatcherConfig::default()
        .with_max_in_flight(args.max_in_flight)
        .with_shutdown_grace(Duration::from_secs(args.grace_secs));

    match args.command {
        Command::Example { endpoint } => {
            let endpoint = parse_endpoint(&endpoint)?;
            let registry = Registry::new();
            register_builtins(&registry).context("failed to register example functions")?;
            server::serve_registry(registry, &endpoint, config).await
        }
        Command::HttpBridge { endpoint } => {
            let endpoint = parse_endpoint(&endpoint)?;
            let registry = Registry::new();
            let controller = Arc::new(HttpController::new());
            controller
                .register(&registry)
                .context("failed to register HTTP bridge functions")?;

            let served = server::serve_registry(registry, &endpoint, config).await;
            if controller.local_addr().await.is_some() {
                let reply = controller.stop().await;
                info!("Stopping HTTP server on exit: {}", reply.message);
            }
            served
        }
        Command::Echo { endpoint } => {
            let endpoint = parse_endpoint(&endpoint)?;
            server::serve_echo(&endpoint).await
        }
    }
}
