//! Request dispatcher.
//!
//! Turns inbound messages into replies: manifest requests are answered from
//! the registry, calls are decoded, run through their handler and encoded
//! back. Every failure becomes an `Error` reply; nothing a client sends can
//! stop the loop.
//!
//! # Concurrency
//!
//! [`Dispatcher::serve`] runs one task per inbound message, bounded by a
//! semaphore. Handler tasks never touch the transport. They push
//! `(token, reply)` into a queue drained by the serve loop itself, which is
//! the only place `Transport::send` is called.

use crate::batch::ArgBatch;
use crate::codec::{ensure_schema, ArrowIpcCodec, Codec};
use crate::config::{DispatcherConfig, RpcConfig};
use crate::message::{MessageKind, RpcMessage};
use crate::registry::Registry;
use crate::transport::{Envelope, ReplyToken, Transport};
use crate::{MangoroError, Result};
use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Routes messages to registered functions.
pub struct Dispatcher {
    registry: Arc<Registry>,
    codec: Arc<dyn Codec>,
    config: DispatcherConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher with the Arrow IPC codec and default limits.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            codec: Arc::new(ArrowIpcCodec::new()),
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Produce the reply for one raw inbound message.
    pub async fn handle(&self, raw: Bytes) -> RpcMessage {
        let msg = match RpcMessage::unmarshal(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return RpcMessage::error("", format!("unmarshal error: {}", e));
            }
        };

        match msg.kind {
            MessageKind::Manifest => self.handle_manifest(),
            MessageKind::Call => self.handle_call(msg).await,
            other => {
                debug!("Rejecting inbound message of kind {}", other.as_u8());
                RpcMessage::error("", "unknown message type")
            }
        }
    }

    fn handle_manifest(&self) -> RpcMessage {
        match self.registry.manifest() {
            Ok(manifest) => {
                debug!("Serving manifest ({} bytes)", manifest.len());
                RpcMessage::manifest_reply(manifest)
            }
            Err(e) => {
                error!("Failed to build manifest: {}", e);
                RpcMessage::error("", format!("manifest error: {}", e))
            }
        }
    }

    async fn handle_call(&self, msg: RpcMessage) -> RpcMessage {
        let name = msg.func_name;
        let function = match self.registry.get(&name) {
            Ok(function) => function,
            Err(MangoroError::UnknownFunction { .. }) => {
                debug!("Call to unknown function {:?}", name);
                return RpcMessage::error(name, "function not found");
            }
            Err(e) => return RpcMessage::error(name, e.to_string()),
        };

        let decoded = if function.signature.variadic {
            self.codec.decode_any(&msg.payload)
        } else {
            self.codec.decode(&msg.payload, &function.input_schema)
        };
        let input = match decoded {
            Ok(batch) => ArgBatch::new(batch),
            Err(e) => {
                debug!("Rejecting call to {}: {}", name, e);
                return RpcMessage::error(name, format!("decode error: {}", e));
            }
        };

        debug!("Calling {} with {} rows", name, input.num_rows());
        let output = match AssertUnwindSafe(function.handler.call(input))
            .catch_unwind()
            .await
        {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                let err = MangoroError::Handler(format!("{:#}", e));
                error!("Handler {} failed: {}", name, err);
                return RpcMessage::error(name, format!("execution error: {}", err));
            }
            Err(_) => {
                let err = MangoroError::Handler("handler panicked".to_string());
                error!("Handler {} panicked", name);
                return RpcMessage::error(name, format!("execution error: {}", err));
            }
        };

        let encoded = ensure_schema(&output, &function.output_schema)
            .and_then(|()| self.codec.encode(&output));
        match encoded {
            Ok(payload) => RpcMessage::result(name, payload),
            Err(e) => {
                error!("Failed to encode result of {}: {}", name, e);
                RpcMessage::error(name, format!("encode error: {}", e))
            }
        }
    }

    /// Serve requests from `transport` until `shutdown` flips to `true` or
    /// the transport closes.
    ///
    /// After the loop stops, replies of in-flight requests are still sent
    /// for up to `shutdown_grace`; tasks still running then are aborted.
    pub async fn serve<T>(
        self: Arc<Self>,
        transport: Arc<T>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        self.config.validate()?;

        let permits = Arc::new(Semaphore::new(self.config.max_in_flight));
        let (reply_tx, mut reply_rx) =
            mpsc::channel::<(ReplyToken, Bytes)>(RpcConfig::REPLY_QUEUE_CAPACITY);
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(
            "Dispatcher serving {} functions (max {} in flight)",
            self.registry.len(),
            self.config.max_in_flight
        );

        let mut stopping = *shutdown.borrow();
        while !stopping {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Dispatcher shutdown requested");
                        stopping = true;
                    }
                }
                Some((token, reply)) = reply_rx.recv() => {
                    send_reply(&*transport, token, reply).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }
                (permit, received) = next_request(&*transport, &permits) => match received {
                    Ok(envelope) => self.spawn_request(&mut tasks, permit, envelope, reply_tx.clone()),
                    Err(MangoroError::TransportClosed) => {
                        info!("Transport closed, dispatcher stopping");
                        stopping = true;
                    }
                    Err(e) => {
                        drop(permit);
                        warn!("Receive failed: {}", e);
                        tokio::time::sleep(RpcConfig::RECV_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(reply_tx);
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!("Waiting up to {:?} for {} in-flight requests", self.config.shutdown_grace, in_flight);
        }

        let drain = async {
            loop {
                tokio::select! {
                    Some((token, reply)) = reply_rx.recv() => {
                        send_reply(&*transport, token, reply).await;
                    }
                    joined = tasks.join_next() => match joined {
                        Some(joined) => log_join(joined),
                        None => break,
                    },
                }
            }
            while let Ok((token, reply)) = reply_rx.try_recv() {
                send_reply(&*transport, token, reply).await;
            }
        };

        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                "Grace period elapsed, aborting {} unfinished requests",
                tasks.len()
            );
            tasks.shutdown().await;
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    fn spawn_request(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        permit: OwnedSemaphorePermit,
        envelope: Envelope,
        reply_tx: mpsc::Sender<(ReplyToken, Bytes)>,
    ) {
        let dispatcher = Arc::clone(self);
        tasks.spawn(async move {
            let _permit = permit;
            let Envelope { token, payload } = envelope;
            let Some(reply) = marshal_reply(dispatcher.handle(payload).await) else {
                error!("Reply for {} could not be framed, dropping it", token);
                return;
            };
            if reply_tx.send((token, reply)).await.is_err() {
                debug!("Reply for {} dropped, dispatcher is gone", token);
            }
        });
    }
}

/// Wait for a free slot, then for the next message.
async fn next_request<T: Transport + ?Sized>(
    transport: &T,
    permits: &Arc<Semaphore>,
) -> (OwnedSemaphorePermit, Result<Envelope>) {
    // The semaphore is never closed.
    let permit = match permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => std::future::pending().await,
    };
    (permit, transport.recv().await)
}

/// Frame a reply, falling back to an `encode error` reply when the message
/// does not fit the wire format.
fn marshal_reply(reply: RpcMessage) -> Option<Bytes> {
    match reply.marshal() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Reply from {:?} does not fit the wire format: {}", reply.func_name, e);
            RpcMessage::error("", format!("encode error: {}", e)).marshal().ok()
        }
    }
}

async fn send_reply<T: Transport + ?Sized>(transport: &T, token: ReplyToken, reply: Bytes) {
    if let Err(e) = transport.send(token, reply).await {
        warn!("Failed to send reply to {}: {}", token, e);
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Request task panicked: {}", e);
        }
    }
}
