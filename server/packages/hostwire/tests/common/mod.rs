#![allow(dead_code)]

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use hostwire::config::ServerConfig;
use hostwire::router::{build_router, AppState};
use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub config: ServerConfig,
    pub workspace: TempDir,
    pub data_dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Workspace and data dir are fresh temp dirs. The model backend points at
    /// a closed port and the model manager at a missing binary unless `setup`
    /// changes them.
    pub fn with_config<F>(setup: F) -> Self
    where
        F: FnOnce(&mut ServerConfig),
    {
        let workspace = tempfile::tempdir().expect("create temp workspace");
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let mut config = ServerConfig::for_workspace(workspace.path(), data_dir.path());
        config.backend_url = closed_port_url();
        config.ollama_bin = PathBuf::from("/nonexistent/hostwire-test-ollama");
        setup(&mut config);
        let app = build_router(AppState::new(&config).expect("create app state"));
        Self {
            app,
            config,
            workspace,
            data_dir,
        }
    }

    /// A second app over the same config and data dir, as after a restart.
    pub fn restart(&self) -> Router {
        build_router(AppState::new(&self.config).expect("reload app state"))
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let body = body.map(|value| value.to_string());
    let (status, bytes) = send_raw(app, method, uri, body.as_deref()).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

pub async fn send_raw(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<&str>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(text) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(text.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, bytes.to_vec())
}

pub async fn call_tool(app: &Router, name: &str, parameters: Value) -> (StatusCode, Value) {
    send_json(
        app,
        Method::POST,
        "/tools",
        Some(json!({ "tool_name": name, "parameters": parameters })),
    )
    .await
}

/// Splits an SSE body into the data payload of each event.
pub fn sse_data_lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

/// URL of a port that was just released, so connections are refused.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind a free port");
    let addr = listener.local_addr().expect("free port address");
    drop(listener);
    format!("http://{addr}")
}

#[derive(Clone)]
struct FakeBackendState {
    requests: Arc<Mutex<Vec<Value>>>,
    lines: Arc<Vec<String>>,
    chunk_size: usize,
    endless: bool,
    body_dropped: Arc<AtomicBool>,
}

/// Stand-in for the model backend's `/api/chat`.
pub struct FakeBackend {
    pub url: String,
    requests: Arc<Mutex<Vec<Value>>>,
    body_dropped: Arc<AtomicBool>,
}

/// Flags the streamed body as gone once hyper drops it.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl FakeBackend {
    /// Streaming requests get `lines` as NDJSON, cut into `chunk_size`-byte
    /// pieces; non-streaming ones get a single completion object.
    pub async fn start(lines: Vec<String>, chunk_size: usize) -> Self {
        Self::spawn(lines, chunk_size, false).await
    }

    /// Like `start`, but the streamed body never ends: after `lines` it keeps
    /// trickling blank lines until the client goes away.
    pub async fn start_endless(lines: Vec<String>) -> Self {
        Self::spawn(lines, 64, true).await
    }

    async fn spawn(lines: Vec<String>, chunk_size: usize, endless: bool) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let body_dropped = Arc::new(AtomicBool::new(false));
        let state = FakeBackendState {
            requests: requests.clone(),
            lines: Arc::new(lines),
            chunk_size: chunk_size.max(1),
            endless,
            body_dropped: body_dropped.clone(),
        };
        let app = Router::new()
            .route("/api/chat", post(fake_chat))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("fake backend address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{addr}"),
            requests,
            body_dropped,
        }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Polls until the streamed body was dropped or `limit` passes.
    pub async fn wait_for_body_drop(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.body_dropped.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.body_dropped.load(Ordering::SeqCst)
    }
}

async fn fake_chat(State(state): State<FakeBackendState>, Json(body): Json<Value>) -> Response {
    state
        .requests
        .lock()
        .expect("requests lock")
        .push(body.clone());
    if body["stream"] != Value::Bool(true) {
        return Json(json!({
            "model": body["model"],
            "message": {"role": "assistant", "content": "hello"},
            "done": true
        }))
        .into_response();
    }

    let mut payload = String::new();
    for line in state.lines.iter() {
        payload.push_str(line);
        payload.push('\n');
    }
    let chunks: Vec<Result<Vec<u8>, Infallible>> = payload
        .as_bytes()
        .chunks(state.chunk_size)
        .map(|chunk| Ok(chunk.to_vec()))
        .collect();
    let head = futures::stream::iter(chunks);
    let body = if state.endless {
        let flag = DropFlag(state.body_dropped.clone());
        let tail = futures::stream::unfold(flag, |flag| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Some((Ok::<Vec<u8>, Infallible>(b"\n".to_vec()), flag))
        });
        Body::from_stream(head.chain(tail))
    } else {
        Body::from_stream(head)
    };
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

#[cfg(unix)]
pub fn write_executable(path: &Path, script: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, script).expect("write executable");
    let mut perms = std::fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("set mode");
}
