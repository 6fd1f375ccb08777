//! Worker runtime: bind the endpoint, serve until a shutdown signal.

use anyhow::Result;
use mangoro_core::{
    Dispatcher, DispatcherConfig, Endpoint, MangoroError, Registry, SocketTransport, Transport,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Serve `registry` on `endpoint` until Ctrl-C.
pub async fn serve_registry(
    registry: Registry,
    endpoint: &Endpoint,
    config: DispatcherConfig,
) -> Result<()> {
    config.validate()?;
    info!("Registered functions: {:?}", registry.list()?);

    let transport = Arc::new(SocketTransport::bind(endpoint).await?);
    announce(transport.endpoint());

    let (stop, shutdown) = watch::channel(false);
    spawn_signal_watcher(stop);

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry)).with_config(config));
    dispatcher.serve(transport, shutdown).await?;
    info!("Worker stopped");
    Ok(())
}

/// Reply to every message with its own bytes.
pub async fn serve_echo(endpoint: &Endpoint) -> Result<()> {
    let transport = SocketTransport::bind(endpoint).await?;
    announce(transport.endpoint());

    let (stop, mut shutdown) = watch::channel(false);
    spawn_signal_watcher(stop);

    loop {
        let envelope = tokio::select! {
            _ = shutdown.changed() => break,
            received = transport.recv() => match received {
                Ok(envelope) => envelope,
                Err(MangoroError::TransportClosed) => break,
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    continue;
                }
            },
        };
        debug!("Echoing {} bytes to {}", envelope.payload.len(), envelope.token);
        if let Err(e) = transport.send(envelope.token, envelope.payload).await {
            warn!("Failed to send echo reply: {}", e);
        }
    }

    info!("Echo server stopped");
    Ok(())
}

/// Print the bound endpoint for the parent process.
fn announce(endpoint: &Endpoint) {
    // Intentional stdout: parent processes read this line to find the worker.
    println!("RPC_ENDPOINT={}", endpoint);
    info!("RPC server listening on {}", endpoint);
}

fn spawn_signal_watcher(stop: watch::Sender<bool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = stop.send(true);
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
                // Keep the sender alive so the server is not told to stop.
                std::future::pending::<()>().await;
                drop(stop);
            }
        }
    });
}
