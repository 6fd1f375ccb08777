//! HTTP static file server controlled over RPC.
//!
//! Registers `startServer`, `stopServer` and `serverStatus`. All three reply
//! with a single row `{status, message}`. The running server belongs to an
//! [`HttpController`] instance, so two controllers in one process manage two
//! independent servers.
//!
//! With `tls` set the server speaks HTTPS from a PEM certificate and key.
//! rustls negotiates TLS 1.2 or 1.3 only.
//!
//! # Thread Safety
//!
//! Server state sits behind a tokio `Mutex`. `startServer` holds it through
//! the startup window, so concurrent start/stop calls are applied one after
//! the other.

use arrow::array::{ArrayRef, StringArray};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use mangoro_core::{
    batch_from_columns, ArgBatch, ArgSpec, FieldDef, FunctionSignature, Handler, Registry,
    StructDef, TypeSpec,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Controller timings.
pub struct HttpConfig;

impl HttpConfig {
    /// How long a freshly started server may fail before it counts as up.
    pub const STARTUP_WINDOW: Duration = Duration::from_millis(500);
    /// Upper bound on a graceful stop.
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Reply row shared by the controller functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub status: String,
    pub message: String,
}

impl ControlReply {
    fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: message.into(),
        }
    }

    fn ok(message: impl Into<String>) -> Self {
        Self::new("ok", message)
    }

    fn error(message: impl Into<String>) -> Self {
        Self::new("error", message)
    }

    pub fn to_batch(&self) -> mangoro_core::Result<RecordBatch> {
        batch_from_columns(vec![
            (
                "status",
                Arc::new(StringArray::from(vec![self.status.as_str()])) as ArrayRef,
            ),
            (
                "message",
                Arc::new(StringArray::from(vec![self.message.as_str()])) as ArrayRef,
            ),
        ])
    }
}

/// Arguments of `startServer`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub addr: String,
    pub dir: PathBuf,
    pub prefix: String,
    pub cors: bool,
    pub coop: bool,
    pub tls: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub silent: bool,
}

impl StartOptions {
    /// Defaults for everything but the address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dir: PathBuf::from("."),
            prefix: "/".to_string(),
            cors: false,
            coop: false,
            tls: false,
            cert: None,
            key: None,
            silent: false,
        }
    }

    /// Read the first row of a `startServer` input batch.
    pub fn from_batch(input: &ArgBatch) -> anyhow::Result<Self> {
        let addr = input
            .opt_str("addr")?
            .ok_or_else(|| anyhow::anyhow!("no server address provided"))?;
        Ok(Self {
            addr,
            dir: PathBuf::from(input.str_or("dir", ".")?),
            prefix: input.str_or("prefix", "/")?,
            cors: input.bool_or("cors", false)?,
            coop: input.bool_or("coop", false)?,
            tls: input.bool_or("tls", false)?,
            cert: input.opt_str("cert")?,
            key: input.opt_str("key")?,
            silent: input.bool_or("silent", false)?,
        })
    }
}

struct RunningServer {
    addr: String,
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// Owns at most one running HTTP server.
#[derive(Default)]
pub struct HttpController {
    server: Mutex<Option<RunningServer>>,
}

impl std::fmt::Debug for HttpController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpController").finish_non_exhaustive()
    }
}

impl HttpController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start serving `options.dir`.
    pub async fn start(&self, options: StartOptions) -> ControlReply {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return ControlReply::error("HTTP server already running");
        }
        let tls = if options.tls {
            match load_tls(&options).await {
                Ok(config) => Some(config),
                Err(message) => {
                    return ControlReply::error(format!("failed to start server: {}", message))
                }
            }
        } else {
            None
        };

        let dir = match absolute(&options.dir) {
            Ok(dir) => dir,
            Err(e) => return ControlReply::error(format!("invalid directory: {}", e)),
        };
        let prefix = match normalize_prefix(&options.prefix) {
            Ok(prefix) => prefix,
            Err(message) => return ControlReply::error(message),
        };

        let listener = match TcpListener::bind(options.addr.as_str()).await {
            Ok(listener) => listener,
            Err(e) => return ControlReply::error(format!("failed to start server: {}", e)),
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => return ControlReply::error(format!("failed to start server: {}", e)),
        };

        let router = build_router(&dir, &prefix, &options);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let scheme = if tls.is_some() { "HTTPS" } else { "HTTP" };
        let mut task = match tls {
            None => tokio::spawn(serve_plain(listener, router, shutdown_rx)),
            Some(config) => match listener.into_std() {
                Ok(listener) => tokio::spawn(serve_tls(listener, config, router, shutdown_rx)),
                Err(e) => return ControlReply::error(format!("failed to start server: {}", e)),
            },
        };

        // A server that dies right away reports the failure to the caller.
        if let Ok(finished) = tokio::time::timeout(HttpConfig::STARTUP_WINDOW, &mut task).await {
            let reason = match finished {
                Ok(Ok(())) => "server exited immediately".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            return ControlReply::error(format!("failed to start server: {}", reason));
        }

        info!(
            "{} server on {} serving {} at {}",
            scheme,
            local_addr,
            dir.display(),
            prefix
        );
        *server = Some(RunningServer {
            addr: options.addr.clone(),
            local_addr,
            shutdown_tx,
            task,
        });
        ControlReply::ok(format!("HTTP server started on {}", options.addr))
    }

    /// Stop the running server, waiting up to `STOP_TIMEOUT`.
    pub async fn stop(&self) -> ControlReply {
        let Some(running) = self.server.lock().await.take() else {
            return ControlReply::error("No HTTP server is running");
        };

        let _ = running.shutdown_tx.send(());
        let abort = running.task.abort_handle();
        match tokio::time::timeout(HttpConfig::STOP_TIMEOUT, running.task).await {
            Ok(Ok(Ok(()))) => {
                info!("HTTP server on {} stopped", running.local_addr);
                ControlReply::ok("HTTP server stopped")
            }
            Ok(Ok(Err(e))) => ControlReply::error(format!("shutdown failed: {}", e)),
            Ok(Err(e)) => ControlReply::error(format!("shutdown failed: {}", e)),
            Err(_) => {
                warn!(
                    "HTTP server on {} did not stop within {:?}, aborting",
                    running.local_addr,
                    HttpConfig::STOP_TIMEOUT
                );
                abort.abort();
                ControlReply::error("shutdown failed: timed out waiting for connections to close")
            }
        }
    }

    pub async fn status(&self) -> ControlReply {
        match self.server.lock().await.as_ref() {
            Some(running) => ControlReply::new("status", format!("running at {}", running.addr)),
            None => ControlReply::new("status", "stopped"),
        }
    }

    /// Address the running server is bound to.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Register the three controller functions bound to this instance.
    pub fn register(self: &Arc<Self>, registry: &Registry) -> mangoro_core::Result<()> {
        registry.register(
            "startServer",
            StartServer(self.clone()),
            start_server_signature(),
        )?;
        registry.register(
            "stopServer",
            StopServer(self.clone()),
            control_signature("Stop HTTP server"),
        )?;
        registry.register(
            "serverStatus",
            ServerStatus(self.clone()),
            control_signature("HTTP server status"),
        )?;
        Ok(())
    }
}

/// Load the PEM pair named by `options`.
async fn load_tls(options: &StartOptions) -> Result<RustlsConfig, String> {
    let given = |path: &Option<String>| path.clone().filter(|p| !p.is_empty());
    let (Some(cert), Some(key)) = (given(&options.cert), given(&options.key)) else {
        return Err("certificate and key required for TLS".to_string());
    };
    // Err means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(|e| format!("cannot load certificate {} and key {}: {}", cert, key, e))
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
}

async fn serve_tls(
    listener: std::net::TcpListener,
    config: RustlsConfig,
    router: Router,
    shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let handle = Handle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        if shutdown_rx.await.is_ok() {
            trigger.graceful_shutdown(Some(HttpConfig::STOP_TIMEOUT));
        }
    });
    axum_server::from_tcp_rustls(listener, config)
        .handle(handle)
        .serve(router.into_make_service())
        .await
}

fn absolute(dir: &Path) -> std::io::Result<PathBuf> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

/// `/`, or a path with a leading and no trailing slash.
fn normalize_prefix(prefix: &str) -> Result<String, String> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    let prefix = format!("/{}", trimmed);
    if prefix == "/ws" {
        return Err("prefix /ws is reserved".to_string());
    }
    Ok(prefix)
}

fn build_router(dir: &Path, prefix: &str, options: &StartOptions) -> Router {
    let files = ServeDir::new(dir);
    let router = Router::new().route(
        "/ws",
        any(|| async { (StatusCode::NOT_IMPLEMENTED, "websocket proxy not implemented") }),
    );
    let mut router = if prefix == "/" {
        router.fallback_service(files)
    } else {
        router.nest_service(prefix, files)
    };

    if options.cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::RANGE])
                .expose_headers([
                    header::CONTENT_LENGTH,
                    header::CONTENT_RANGE,
                    header::ACCEPT_RANGES,
                ]),
        );
    }
    if options.coop {
        router = router.layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cross-origin-opener-policy"),
            HeaderValue::from_static("same-origin"),
        ));
    }
    if !options.silent {
        router = router.layer(TraceLayer::new_for_http());
    }
    router
}

fn reply_signature() -> TypeSpec {
    TypeSpec::structure(StructDef::new(vec![
        FieldDef::new("status", TypeSpec::string()),
        FieldDef::new("message", TypeSpec::string()),
    ]))
}

fn start_server_signature() -> FunctionSignature {
    FunctionSignature::new(
        vec![
            ArgSpec::new("addr", TypeSpec::string()),
            ArgSpec::new("dir", TypeSpec::string()),
            ArgSpec::new("prefix", TypeSpec::string()),
            ArgSpec::new("cors", TypeSpec::bool()),
            ArgSpec::new("coop", TypeSpec::bool()),
            ArgSpec::new("tls", TypeSpec::bool()),
            ArgSpec::new("cert", TypeSpec::string().nullable()),
            ArgSpec::new("key", TypeSpec::string().nullable()),
            ArgSpec::new("silent", TypeSpec::bool()),
        ],
        reply_signature(),
    )
    .with_description("Start HTTP server")
}

fn control_signature(description: &str) -> FunctionSignature {
    FunctionSignature::new(vec![], reply_signature()).with_description(description)
}

struct StartServer(Arc<HttpController>);

#[async_trait]
impl Handler for StartServer {
    async fn call(&self, input: ArgBatch) -> anyhow::Result<RecordBatch> {
        let options = StartOptions::from_batch(&input)?;
        debug!("startServer on {}", options.addr);
        Ok(self.0.start(options).await.to_batch()?)
    }
}

struct StopServer(Arc<HttpController>);

#[async_trait]
impl Handler for StopServer {
    async fn call(&self, _input: ArgBatch) -> anyhow::Result<RecordBatch> {
        Ok(self.0.stop().await.to_batch()?)
    }
}

struct ServerStatus(Arc<HttpController>);

#[async_trait]
impl Handler for ServerStatus {
    async fn call(&self, _input: ArgBatch) -> anyhow::Result<RecordBatch> {
        Ok(self.0.status().await.to_batch()?)
    }
}
