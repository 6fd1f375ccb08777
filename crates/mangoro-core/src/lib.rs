//! Mangoro Core - typed function registry and RPC protocol for columnar
//! worker processes.
//!
//! A worker registers named functions with their argument and return types,
//! then serves them over a request/reply transport. Clients discover what is
//! available through the manifest and call functions with columnar batches
//! (Arrow IPC) as arguments and results.
//!
//! # Example
//!
//! ```rust,ignore
//! use mangoro_core::{
//!     single_column, ArgBatch, ArgSpec, Dispatcher, Endpoint, FunctionSignature, Registry,
//!     SocketTransport, TypeSpec,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Registry::new();
//!     registry.register(
//!         "sum",
//!         |input: &ArgBatch| -> anyhow::Result<_> {
//!             let total: f64 = input.float64("x")?.iter().flatten().sum();
//!             Ok(single_column("result", Arc::new(arrow::array::Float64Array::from(vec![total])))?)
//!         },
//!         FunctionSignature::new(vec![ArgSpec::new("x", TypeSpec::float64())], TypeSpec::float64()),
//!     )?;
//!
//!     let transport = Arc::new(SocketTransport::bind(&"tcp://127.0.0.1:5555".parse()?).await?);
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     Arc::new(Dispatcher::new(Arc::new(registry))).serve(transport, shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod schema;
pub mod transport;
pub mod types;

pub use batch::{batch_from_columns, single_column, ArgBatch};
pub use client::RpcClient;
pub use codec::{ArrowIpcCodec, Codec};
pub use config::{DispatcherConfig, RpcConfig};
pub use dispatcher::Dispatcher;
pub use error::{ErrorCategory, MangoroError, Result};
pub use handler::Handler;
pub use message::{MessageKind, RpcMessage};
pub use registry::{parse_manifest, RegisteredFunction, Registry};
pub use transport::{
    Endpoint, Envelope, MemoryClient, MemoryTransport, ReplyToken, SocketTransport, Transport,
};
pub use types::{ArgSpec, FieldDef, FunctionSignature, ScalarKind, StructDef, TypeSpec};
