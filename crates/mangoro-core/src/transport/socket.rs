//! Stream socket transport.
//!
//! Listens on a TCP address or a Unix domain socket and accepts any number of
//! client connections. Each connection is served by one task with
//! request/reply lockstep: it reads a frame, tags it with a [`ReplyToken`],
//! waits for the matching reply and writes it before reading the next frame.
//! Replies therefore come back in request order, and a peer that stops
//! reading only ever stalls its own connection.
//!
//! # Thread Safety
//!
//! Inbound frames from all connections funnel into one channel drained by
//! `recv`. The connection table is a `std::sync::Mutex` held only to clone a
//! reply queue handle; no await happens under it. `send` never waits on a
//! peer.

use super::framing::{read_frame, write_frame};
use super::{Envelope, ReplyToken, Transport};
use crate::config::RpcConfig;
use crate::{MangoroError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where a socket transport listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `ipc:///path/to.sock`
    Ipc(PathBuf),
}

impl FromStr for Endpoint {
    type Err = MangoroError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| MangoroError::InvalidEndpoint {
            endpoint: s.to_string(),
            message: message.to_string(),
        };

        if let Some(addr) = s.strip_prefix("tcp://") {
            // A leading `*` means every interface.
            let addr = match addr.strip_prefix("*:") {
                Some(port) => format!("0.0.0.0:{}", port),
                None => addr.to_string(),
            };
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Endpoint::Tcp(addr))
                }
                _ => Err(invalid("expected tcp://host:port")),
            }
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid("missing socket path"));
            }
            Ok(Endpoint::Ipc(PathBuf::from(path)))
        } else {
            Err(invalid("unsupported scheme (use tcp:// or ipc://)"))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// Byte stream of either socket flavor.
pub(crate) trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Open a client connection to `endpoint`.
pub(crate) async fn connect(endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
    let connecting = async {
        let stream: Box<dyn Connection> = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "ipc endpoints need Unix domain sockets",
                ))
            }
        };
        Ok::<_, std::io::Error>(stream)
    };

    tokio::time::timeout(RpcConfig::CONNECT_TIMEOUT, connecting)
        .await
        .map_err(|_| MangoroError::transport(format!("connecting to {} timed out", endpoint)))?
        .map_err(|e| MangoroError::transport(format!("failed to connect to {}: {}", endpoint, e)))
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(Box<dyn Connection>, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let stream: Box<dyn Connection> = Box::new(stream);
                Ok((stream, peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let stream: Box<dyn Connection> = Box::new(stream);
                Ok((stream, "unix peer".to_string()))
            }
        }
    }
}

/// Reply queues by connection id. Entries carry the request sequence number
/// the reply answers.
type WriterTable = Mutex<HashMap<u64, mpsc::Sender<(u64, Bytes)>>>;

/// Listening socket transport.
pub struct SocketTransport {
    endpoint: Endpoint,
    inbox: TokioMutex<mpsc::Receiver<Envelope>>,
    writers: Arc<WriterTable>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl SocketTransport {
    /// Bind and start accepting connections.
    ///
    /// For TCP, port 0 picks a free port; [`endpoint`](Self::endpoint)
    /// reports the one actually bound. For IPC, a stale socket file at the
    /// path is replaced.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let (listener, bound) = match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = listener.local_addr()?;
                (Listener::Tcp(listener), Endpoint::Tcp(local.to_string()))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                (Listener::Unix(listener), endpoint.clone())
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                return Err(MangoroError::InvalidEndpoint {
                    endpoint: endpoint.to_string(),
                    message: "ipc endpoints need Unix domain sockets".to_string(),
                })
            }
        };

        info!("RPC transport listening on {}", bound);

        let (inbox_tx, inbox_rx) = mpsc::channel(RpcConfig::INBOUND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writers: Arc<WriterTable> = Arc::new(Mutex::new(HashMap::new()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            inbox_tx,
            writers.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            endpoint: bound,
            inbox: TokioMutex::new(inbox_rx),
            writers,
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }

    /// Endpoint actually bound.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop accepting connections and reading requests.
    ///
    /// Replies to requests already received can still be sent. `recv`
    /// reports `TransportClosed` once the queued requests are drained.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.accept_task.take() {
            handle.abort();
        }
        // Connections still waiting on a reply see their queue close.
        if let Ok(mut table) = self.writers.lock() {
            table.clear();
        }
        if let Endpoint::Ipc(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn recv(&self) -> Result<Envelope> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(MangoroError::TransportClosed)
    }

    async fn send(&self, token: ReplyToken, payload: Bytes) -> Result<()> {
        let connection = token.connection();
        let mut table = self.writers.lock().map_err(|_| MangoroError::LockPoisoned {
            resource: "socket connections",
        })?;
        let writer = table.get(&connection).ok_or_else(|| {
            MangoroError::transport(format!("connection {} is closed", connection))
        })?;

        match writer.try_send((token.request(), payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Connection {} is not taking replies, dropping it", connection);
                table.remove(&connection);
                Err(MangoroError::transport(format!(
                    "connection {} reply queue is full",
                    connection
                )))
            }
            Err(TrySendError::Closed(_)) => {
                table.remove(&connection);
                Err(MangoroError::transport(format!("connection {} is closed", connection)))
            }
        }
    }
}

async fn accept_loop(
    listener: Listener,
    inbox_tx: mpsc::Sender<Envelope>,
    writers: Arc<WriterTable>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("RPC transport no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("RPC accept error: {}", e);
                        continue;
                    }
                };

                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let (writer_tx, writer_rx) = mpsc::channel(RpcConfig::OUTBOUND_CHANNEL_CAPACITY);
                {
                    let Ok(mut table) = writers.lock() else {
                        error!("Connection table poisoned, dropping connection from {}", peer);
                        continue;
                    };
                    if table.len() >= RpcConfig::MAX_CONNECTIONS {
                        warn!(
                            "Rejecting connection from {}: at max capacity ({})",
                            peer,
                            RpcConfig::MAX_CONNECTIONS
                        );
                        continue;
                    }
                    table.insert(id, writer_tx);
                }

                debug!("Connection {} from {}", id, peer);
                let inbox_tx = inbox_tx.clone();
                let writers = writers.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    match serve_connection(id, stream, inbox_tx, writer_rx, shutdown).await {
                        Ok(ConnectionEnd::Shutdown) => debug!("Connection {} closed on shutdown", id),
                        Ok(ConnectionEnd::Disconnected) => debug!("Connection {} closed by peer", id),
                        Err(e) => debug!("Connection {} ended: {}", id, e),
                    }
                    if let Ok(mut table) = writers.lock() {
                        table.remove(&id);
                    }
                });
            }
        }
    }
}

enum ConnectionEnd {
    Disconnected,
    Shutdown,
}

/// Read a request, hand it to the inbox, write its reply, repeat.
///
/// Shutdown is only observed between requests, so a request already read
/// still gets its reply during the grace period.
async fn serve_connection(
    id: u64,
    mut stream: Box<dyn Connection>,
    inbox_tx: mpsc::Sender<Envelope>,
    mut replies: mpsc::Receiver<(u64, Bytes)>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<ConnectionEnd> {
    let mut seq = 0u64;
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => match frame? {
                Some(frame) => frame,
                None => return Ok(ConnectionEnd::Disconnected),
            },
            _ = shutdown_rx.changed() => return Ok(ConnectionEnd::Shutdown),
        };

        seq += 1;
        let envelope = Envelope {
            token: ReplyToken::new(id, seq),
            payload: frame,
        };
        if inbox_tx.send(envelope).await.is_err() {
            return Err(MangoroError::TransportClosed);
        }

        let reply = loop {
            match replies.recv().await {
                Some((request, reply)) if request == seq => break reply,
                Some((request, _)) => {
                    warn!(
                        "Connection {} dropping reply to request {} while waiting for {}",
                        id, request, seq
                    );
                }
                None => {
                    return Err(MangoroError::transport(format!(
                        "connection {} reply queue closed",
                        id
                    )))
                }
            }
        };
        write_frame(&mut stream, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            "tcp://127.0.0.1:5555".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:5555".to_string())
        );
        assert_eq!(
            "tcp://*:7000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("0.0.0.0:7000".to_string())
        );
        assert_eq!(
            "ipc:///tmp/mangoro.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/mangoro.sock"))
        );
    }

    #[test]
    fn test_parse_rejects_bad_endpoints() {
        for bad in ["http://x:1", "tcp://nohost", "tcp://:80", "tcp://h:notaport", "ipc://", ""] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(MangoroError::InvalidEndpoint { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_endpoint_display_roundtrip() {
        for s in ["tcp://127.0.0.1:9", "ipc:///tmp/a.sock"] {
            assert_eq!(s.parse::<Endpoint>().unwrap().to_string(), s);
        }
    }

    #[tokio::test]
    async fn test_bind_reports_assigned_port() {
        let transport = SocketTransport::bind(&"tcp://127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        match transport.endpoint() {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected endpoint {other}"),
        }
    }

    #[tokio::test]
    async fn test_frames_routed_back_to_sender() {
        let transport = Arc::new(
            SocketTransport::bind(&"tcp://127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let endpoint = transport.endpoint().clone();

        let echo = {
            let transport = transport.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    let env = transport.recv().await.unwrap();
                    transport.send(env.token, env.payload).await.unwrap();
                }
            })
        };

        let mut a = connect(&endpoint).await.unwrap();
        let mut b = connect(&endpoint).await.unwrap();
        write_frame(&mut a, b"from a").await.unwrap();
        write_frame(&mut b, b"from b").await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap().as_ref(), b"from b");
        assert_eq!(read_frame(&mut a).await.unwrap().unwrap().as_ref(), b"from a");
        echo.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ipc_endpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Ipc(dir.path().join("rpc.sock"));
        let transport = Arc::new(SocketTransport::bind(&endpoint).await.unwrap());

        let echo = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let env = transport.recv().await.unwrap();
                transport.send(env.token, env.payload).await.unwrap();
            })
        };

        let mut client = connect(&endpoint).await.unwrap();
        write_frame(&mut client, b"ping").await.unwrap();
        assert_eq!(read_frame(&mut client).await.unwrap().unwrap().as_ref(), b"ping");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_recv() {
        let transport = SocketTransport::bind(&"tcp://127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        transport.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), transport.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(MangoroError::TransportClosed)));
    }
}
