//! Centralized configuration for Mangoro.
//!
//! Protocol and transport limits live here as constants; the dispatcher's
//! tunables are a plain struct so the binary can override them from flags.

use crate::{MangoroError, Result};
use std::time::Duration;

/// Wire and transport limits.
pub struct RpcConfig;

impl RpcConfig {
    /// Largest message accepted on a stream transport.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
    /// Capacity of the transport inbox shared by all connections.
    pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;
    /// Capacity of each connection's reply queue. Connections run one
    /// request at a time, so a full queue means the peer is misbehaving.
    pub const OUTBOUND_CHANNEL_CAPACITY: usize = 4;
    /// Capacity of the dispatcher's reply queue.
    pub const REPLY_QUEUE_CAPACITY: usize = 1024;
    /// Pause after a failed receive before trying again.
    pub const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);
    /// Client connection timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Maximum concurrent client connections on a socket transport.
    pub const MAX_CONNECTIONS: usize = 256;
}

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of requests handled at the same time.
    pub max_in_flight: usize,
    /// How long in-flight requests may keep running after shutdown starts.
    pub shutdown_grace: Duration,
}

impl DispatcherConfig {
    pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(MangoroError::Config {
                message: "max_in_flight must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: Self::DEFAULT_MAX_IN_FLIGHT,
            shutdown_grace: Self::DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
