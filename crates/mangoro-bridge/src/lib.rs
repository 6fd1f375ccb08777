//! Mangoro Bridge - ready-made worker functions.
//!
//! # Modules
//!
//! - `builtins` - `add`, `echoString` and `transposeMatrix` array functions
//! - `http` - start, stop and inspect a static file HTTP server over RPC

pub mod builtins;
pub mod http;

pub use builtins::register_builtins;
pub use http::{ControlReply, HttpConfig, HttpController, StartOptions};
