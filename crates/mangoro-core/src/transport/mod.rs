//! Message transports.
//!
//! A transport delivers whole messages in and out of the dispatcher. Every
//! inbound message carries a [`ReplyToken`] naming where its reply has to go,
//! so replies to concurrent requests can be sent in any order.

pub mod framing;
pub mod memory;
pub mod socket;

pub use memory::{MemoryClient, MemoryTransport};
pub use socket::{Endpoint, SocketTransport};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Opaque reply address issued by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyToken {
    connection: u64,
    request: u64,
}

impl ReplyToken {
    pub fn new(connection: u64, request: u64) -> Self {
        Self {
            connection,
            request,
        }
    }

    /// Connection (or peer) the request arrived on.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Per-connection request sequence number.
    pub fn request(&self) -> u64 {
        self.request
    }
}

impl fmt::Display for ReplyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.request)
    }
}

/// One inbound message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub token: ReplyToken,
    pub payload: Bytes,
}

/// Request/reply message transport.
///
/// `recv` must be cancel-safe: the dispatcher polls it inside `select!`
/// together with its reply queue.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wait for the next inbound message. Fails with `TransportClosed` once
    /// no further messages can arrive.
    async fn recv(&self) -> Result<Envelope>;

    /// Queue a reply for the peer identified by `token`.
    ///
    /// Must not wait on the peer: a client that stops reading fails its own
    /// sends instead of stalling the dispatcher.
    async fn send(&self, token: ReplyToken, payload: Bytes) -> Result<()>;
}
