//! Socket client for a running dispatcher.
//!
//! # Thread Safety
//!
//! The stream sits behind a tokio `Mutex`, so a client can be shared between
//! tasks; requests on one client are answered one at a time.

use crate::codec::{ArrowIpcCodec, Codec};
use crate::message::{MessageKind, RpcMessage};
use crate::registry::parse_manifest;
use crate::transport::framing::{read_frame, write_frame};
use crate::transport::socket::{self, Connection};
use crate::transport::Endpoint;
use crate::types::FunctionSignature;
use crate::{MangoroError, Result};
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Client side of the socket transport.
pub struct RpcClient {
    stream: Mutex<Box<dyn Connection>>,
    endpoint: Endpoint,
    codec: ArrowIpcCodec,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Connect, giving up after `RpcConfig::CONNECT_TIMEOUT`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = socket::connect(endpoint).await?;
        debug!("RPC client connected to {}", endpoint);
        Ok(Self {
            stream: Mutex::new(stream),
            endpoint: endpoint.clone(),
            codec: ArrowIpcCodec::new(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one message and wait for its reply.
    pub async fn request(&self, msg: &RpcMessage) -> Result<RpcMessage> {
        let frame = msg.marshal()?;
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &frame).await?;
        let reply = read_frame(&mut *stream)
            .await?
            .ok_or(MangoroError::TransportClosed)?;
        RpcMessage::unmarshal(reply)
    }

    /// Fetch the catalog of registered functions.
    pub async fn manifest(&self) -> Result<BTreeMap<String, FunctionSignature>> {
        let reply = self.request(&RpcMessage::manifest_request()).await?;
        match reply.kind {
            MessageKind::Manifest => parse_manifest(&reply.payload),
            MessageKind::Error => Err(MangoroError::Remote {
                func_name: reply.func_name,
                message: reply.error_message,
            }),
            other => Err(MangoroError::UnknownMessageKind(other.as_u8())),
        }
    }

    /// Call `name` with `input` and decode the result batch.
    pub async fn call(&self, name: &str, input: &RecordBatch) -> Result<RecordBatch> {
        let payload = self.codec.encode(input)?;
        let reply = self.request(&RpcMessage::call(name, payload)).await?;
        match reply.kind {
            MessageKind::Result => self.codec.decode_any(&reply.payload),
            MessageKind::Error => Err(MangoroError::Remote {
                func_name: reply.func_name,
                message: reply.error_message,
            }),
            other => Err(MangoroError::UnknownMessageKind(other.as_u8())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        // Bind then drop to find a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Endpoint::Tcp(addr.to_string());
        let err = RpcClient::connect(&endpoint).await.unwrap_err();
        assert!(matches!(err, MangoroError::Transport { .. }));
    }
}
