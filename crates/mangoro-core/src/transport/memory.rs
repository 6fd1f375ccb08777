//! In-process transport.
//!
//! Channels instead of sockets, for tests and for embedding a dispatcher in
//! the same process as its caller.

use super::{Envelope, ReplyToken, Transport};
use crate::config::RpcConfig;
use crate::message::RpcMessage;
use crate::{MangoroError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

/// Dispatcher side of the in-process transport.
pub struct MemoryTransport {
    /// Taken on `close`; clients keep their own clones.
    inbox_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    inbox: TokioMutex<mpsc::Receiver<Envelope>>,
    /// Reply queues by client id, tagged with the request they answer.
    peers: Mutex<HashMap<u64, mpsc::Sender<(u64, Bytes)>>>,
    next_peer: AtomicU64,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("next_peer", &self.next_peer)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(RpcConfig::INBOUND_CHANNEL_CAPACITY);
        Self {
            inbox_tx: Mutex::new(Some(tx)),
            inbox: TokioMutex::new(rx),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        }
    }

    /// Attach a new client.
    pub fn connect(&self) -> Result<MemoryClient> {
        let inbox_tx = self
            .inbox_tx
            .lock()
            .map_err(|_| MangoroError::LockPoisoned {
                resource: "memory transport inbox",
            })?
            .clone()
            .ok_or(MangoroError::TransportClosed)?;

        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = mpsc::channel(RpcConfig::OUTBOUND_CHANNEL_CAPACITY);
        self.peers_lock()?.insert(id, reply_tx);
        debug!("Memory client {} attached", id);

        Ok(MemoryClient {
            id,
            inbox_tx,
            replies: TokioMutex::new(reply_rx),
            next_request: AtomicU64::new(1),
        })
    }

    /// Stop accepting new clients. `recv` reports `TransportClosed` once every
    /// existing client has been dropped and the inbox is drained.
    pub fn close(&self) {
        if let Ok(mut tx) = self.inbox_tx.lock() {
            tx.take();
        }
    }

    fn peers_lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<(u64, Bytes)>>>> {
        self.peers.lock().map_err(|_| MangoroError::LockPoisoned {
            resource: "memory transport peers",
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn recv(&self) -> Result<Envelope> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(MangoroError::TransportClosed)
    }

    async fn send(&self, token: ReplyToken, payload: Bytes) -> Result<()> {
        let sender = self
            .peers_lock()?
            .get(&token.connection())
            .cloned()
            .ok_or_else(|| {
                MangoroError::transport(format!("client {} is gone", token.connection()))
            })?;
        match sender.try_send((token.request(), payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Client {} is not taking replies", token.connection());
                Err(MangoroError::transport(format!(
                    "client {} reply queue is full",
                    token.connection()
                )))
            }
            Err(TrySendError::Closed(_)) => Err(MangoroError::transport(format!(
                "client {} is gone",
                token.connection()
            ))),
        }
    }
}

/// Caller side of the in-process transport.
///
/// One outstanding request at a time; concurrent callers queue on the
/// reply lock.
pub struct MemoryClient {
    id: u64,
    inbox_tx: mpsc::Sender<Envelope>,
    replies: TokioMutex<mpsc::Receiver<(u64, Bytes)>>,
    next_request: AtomicU64,
}

impl MemoryClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send raw bytes and wait for the reply.
    pub async fn request(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let mut replies = self.replies.lock().await;
        let token = ReplyToken::new(self.id, self.next_request.fetch_add(1, Ordering::Relaxed));
        self.inbox_tx
            .send(Envelope {
                token,
                payload: payload.into(),
            })
            .await
            .map_err(|_| MangoroError::TransportClosed)?;
        // Replies to abandoned earlier requests are skipped.
        loop {
            match replies.recv().await {
                Some((request, reply)) if request == token.request() => return Ok(reply),
                Some((request, _)) => debug!("Client {} skipping stale reply {}", self.id, request),
                None => return Err(MangoroError::TransportClosed),
            }
        }
    }

    /// Send a message and parse the reply.
    pub async fn request_message(&self, msg: &RpcMessage) -> Result<RpcMessage> {
        let reply = self.request(msg.marshal()?).await?;
        RpcMessage::unmarshal(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reply_reaches_sender() {
        let transport = Arc::new(MemoryTransport::new());
        let client = transport.connect().unwrap();

        let server = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let env = transport.recv().await.unwrap();
                let mut reply = env.payload.to_vec();
                reply.reverse();
                transport.send(env.token, Bytes::from(reply)).await.unwrap();
            })
        };

        let reply = client.request(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(reply.as_ref(), b"cba");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_reply_is_skipped() {
        let transport = Arc::new(MemoryTransport::new());
        let client = transport.connect().unwrap();

        let server = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let env = transport.recv().await.unwrap();
                let stale = ReplyToken::new(env.token.connection(), env.token.request() + 10);
                transport.send(stale, Bytes::from_static(b"old")).await.unwrap();
                transport.send(env.token, Bytes::from_static(b"new")).await.unwrap();
            })
        };

        let reply = client.request(Bytes::from_static(b"q")).await.unwrap();
        assert_eq!(reply.as_ref(), b"new");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let transport = MemoryTransport::new();
        let err = transport
            .send(ReplyToken::new(99, 1), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MangoroError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_closed_transport_reports_closed() {
        let transport = MemoryTransport::new();
        let client = transport.connect().unwrap();
        transport.close();
        assert!(matches!(transport.connect(), Err(MangoroError::TransportClosed)));

        drop(client);
        assert!(matches!(
            transport.recv().await,
            Err(MangoroError::TransportClosed)
        ));
    }
}
