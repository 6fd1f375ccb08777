//! Integration tests for the mangoro-rpc binary.
//!
//! Each test starts the real binary on `tcp://127.0.0.1:0`, reads the bound
//! endpoint from its stdout and talks to it with `RpcClient`.

use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use mangoro_core::{
    batch_from_columns, ArrowIpcCodec, Codec, Endpoint, MangoroError, MessageKind, RpcClient,
    RpcMessage,
};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

struct WorkerHandle {
    child: tokio::process::Child,
    endpoint: Endpoint,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl WorkerHandle {
    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn binary() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_mangoro-rpc") {
        return Ok(PathBuf::from(path));
    }
    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("mangoro-rpc");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_mangoro-rpc not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

/// Start the worker and wait for its `RPC_ENDPOINT=` line.
async fn start_worker(subcommand: &str, endpoint: &str) -> Result<WorkerHandle, String> {
    let mut child = tokio::process::Command::new(binary()?)
        .arg(subcommand)
        .arg(endpoint)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn mangoro-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered: Option<Endpoint> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_ENDPOINT=") {
                    let parsed = value
                        .trim()
                        .parse::<Endpoint>()
                        .map_err(|e| format!("invalid RPC_ENDPOINT value '{value}': {e}"))?;
                    discovered = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read mangoro-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let endpoint =
        discovered.ok_or_else(|| "RPC_ENDPOINT line not emitted by mangoro-rpc".to_string())?;
    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(WorkerHandle {
        child,
        endpoint,
        stdout_drain: Some(stdout_drain),
    })
}

fn floats(values: Vec<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(values))
}

#[tokio::test]
async fn test_example_worker_serves_builtins() {
    let worker = start_worker("example", "tcp://127.0.0.1:0").await.unwrap();
    let client = RpcClient::connect(&worker.endpoint).await.unwrap();

    let manifest = client.manifest().await.unwrap();
    assert_eq!(
        manifest.keys().collect::<Vec<_>>(),
        vec!["add", "echoString", "transposeMatrix"]
    );
    assert_eq!(
        manifest["add"].metadata.get("description").map(String::as_str),
        Some("Add two numeric vectors")
    );

    let input: RecordBatch =
        batch_from_columns(vec![("x", floats(vec![1.0, 2.0])), ("y", floats(vec![3.0, 4.0]))])
            .unwrap();
    let out = client.call("add", &input).await.unwrap();
    let sum = out.column(0).as_any().downcast_ref::<Float64Array>().unwrap();
    assert_eq!(sum.values().to_vec(), vec![4.0, 6.0]);

    let strings = batch_from_columns(vec![(
        "s",
        Arc::new(StringArray::from(vec!["mango"])) as ArrayRef,
    )])
    .unwrap();
    let echoed = client.call("echoString", &strings).await.unwrap();
    let echoed = echoed.column(0).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(echoed.value(0), "mango");

    let err = client.call("missing", &input).await.unwrap_err();
    assert!(matches!(err, MangoroError::Remote { ref message, .. } if message == "function not found"));

    worker.stop().await;
}

#[tokio::test]
async fn test_http_bridge_worker_reports_status() {
    let worker = start_worker("http-bridge", "tcp://127.0.0.1:0").await.unwrap();
    let client = RpcClient::connect(&worker.endpoint).await.unwrap();

    // No arguments: an empty payload.
    let reply = client
        .request(&RpcMessage::call("serverStatus", &b""[..]))
        .await
        .unwrap();
    assert_eq!(reply.kind, MessageKind::Result, "unexpected reply {:?}", reply);
    let status = ArrowIpcCodec::new().decode_any(&reply.payload).unwrap();
    let message = status.column(1).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(message.value(0), "stopped");

    worker.stop().await;
}

#[tokio::test]
async fn test_echo_worker_returns_same_bytes() {
    let worker = start_worker("echo", "tcp://127.0.0.1:0").await.unwrap();
    let client = RpcClient::connect(&worker.endpoint).await.unwrap();

    let msg = RpcMessage::call("ping", &b"hello"[..]);
    assert_eq!(client.request(&msg).await.unwrap(), msg);

    worker.stop().await;
}

#[tokio::test]
async fn test_invalid_endpoint_exits_with_error() {
    let status = tokio::process::Command::new(binary().unwrap())
        .arg("example")
        .arg("udp://nowhere")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(!status.success());
}

#[cfg(unix)]
#[tokio::test]
async fn test_example_worker_on_ipc_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = format!("ipc://{}", dir.path().join("example.sock").display());
    let worker = start_worker("example", &endpoint).await.unwrap();
    assert_eq!(worker.endpoint.to_string(), endpoint);

    let client = RpcClient::connect(&worker.endpoint).await.unwrap();
    let matrix = batch_from_columns(vec![
        ("a", floats(vec![1.0, 2.0])),
        ("b", floats(vec![3.0, 4.0])),
    ])
    .unwrap();
    let out = client.call("transposeMatrix", &matrix).await.unwrap();
    assert_eq!(out.num_columns(), 2);
    let first = out.column(0).as_any().downcast_ref::<Float64Array>().unwrap();
    assert_eq!(first.values().to_vec(), vec![1.0, 3.0]);

    worker.stop().await;
}
