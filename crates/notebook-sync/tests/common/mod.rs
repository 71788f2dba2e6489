//! In-process notebook server for integration tests.
//!
//! Serves the REST surface under `/api/v1` and, optionally, the real-time
//! WebSocket at `/ws`. Tests push server events through [`MockServer::push`]
//! and inspect what the client sent through [`MockServer::received`].

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use notebook_sync::session::{NoticeLevel, Notification, SessionEvent, SessionEvents};
use notebook_sync::{ApiClient, SessionConfig, SessionHandle, SessionSnapshot};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Pushing this makes every open socket close.
const KICK: &str = "__kick__";

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

/// Files offered to `file_completion_request`.
pub const FILES: [&str; 3] = ["data.csv", "data.json", "model.pkl"];

pub struct MockState {
    notebooks: Mutex<BTreeMap<String, Value>>,
    received: Mutex<Vec<Value>>,
    push: broadcast::Sender<String>,
    complete_delay: Mutex<Duration>,
    fail_saves: AtomicBool,
    pub puts: AtomicUsize,
    pub executes: AtomicUsize,
    pub connections: AtomicUsize,
}

type Reply = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn detail(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "detail": message })))
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    /// REST and WebSocket.
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// REST only; every socket upgrade fails with 404.
    pub async fn start_without_socket() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(with_socket: bool) -> Self {
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            notebooks: Mutex::new(BTreeMap::new()),
            received: Mutex::new(Vec::new()),
            push,
            complete_delay: Mutex::new(Duration::ZERO),
            fail_saves: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
        });

        let mut app = Router::new()
            .route("/api/v1/notebooks", get(list_notebooks))
            .route(
                "/api/v1/notebooks/{name}",
                get(get_notebook)
                    .post(create_notebook)
                    .put(save_notebook)
                    .delete(delete_notebook),
            )
            .route("/api/v1/kernel/status", get(kernel_status))
            .route("/api/v1/kernel/reset", post(kernel_ok))
            .route("/api/v1/kernel/ensure", post(kernel_ok))
            .route("/api/v1/execute", post(execute))
            .route("/api/v1/complete", post(complete));
        if with_socket {
            app = app.route("/ws", get(ws_handler));
        }
        let app = app.with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn api(&self) -> ApiClient {
        ApiClient::new(&self.base_url).expect("valid base url")
    }

    /// Store a notebook whose cells are code cells with the given sources.
    pub fn seed(&self, name: &str, sources: &[&str]) {
        let cells: Vec<Value> = sources
            .iter()
            .map(|s| json!({ "cell_type": "code", "source": [s], "outputs": [] }))
            .collect();
        self.state.notebooks.lock().unwrap().insert(
            name.to_string(),
            json!({ "cells": cells, "metadata": {}, "nbformat": 4, "nbformat_minor": 4 }),
        );
    }

    pub fn stored(&self, name: &str) -> Option<Value> {
        self.state.notebooks.lock().unwrap().get(name).cloned()
    }

    /// Send a raw frame to every connected client.
    pub fn push_raw(&self, text: &str) {
        let _ = self.state.push.send(text.to_string());
    }

    pub fn push(&self, event: &str, data: Value) {
        self.push_raw(&json!({ "event": event, "data": data }).to_string());
    }

    /// Close every open socket from the server side.
    pub fn kick(&self) {
        self.push_raw(KICK);
    }

    pub fn set_complete_delay(&self, delay: Duration) {
        *self.state.complete_delay.lock().unwrap() = delay;
    }

    /// While set, every save answers 500 and stores nothing.
    pub fn fail_saves(&self, fail: bool) {
        self.state.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// `data` of every client event named `event`, in arrival order.
    pub fn received(&self, event: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v["event"] == event)
            .map(|v| v["data"].clone())
            .collect()
    }

    pub fn puts(&self) -> usize {
        self.state.puts.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.state.executes.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

// ── REST handlers ───────────────────────────────────────────────────

async fn list_notebooks(State(state): State<Arc<MockState>>) -> Json<Value> {
    let names: Vec<String> = state.notebooks.lock().unwrap().keys().cloned().collect();
    Json(json!({ "notebooks": names }))
}

async fn create_notebook(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
) -> Reply {
    let mut notebooks = state.notebooks.lock().unwrap();
    if notebooks.contains_key(&name) {
        return Err(detail(StatusCode::BAD_REQUEST, "Notebook already exists"));
    }
    notebooks.insert(
        name.clone(),
        json!({ "cells": [], "metadata": {}, "nbformat": 4, "nbformat_minor": 4 }),
    );
    Ok(Json(json!({ "message": format!("Created {}", name) })))
}

async fn get_notebook(State(state): State<Arc<MockState>>, Path(name): Path<String>) -> Reply {
    state
        .notebooks
        .lock()
        .unwrap()
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| detail(StatusCode::NOT_FOUND, "Notebook not found"))
}

async fn save_notebook(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Reply {
    state.puts.fetch_add(1, Ordering::SeqCst);
    if state.fail_saves.load(Ordering::SeqCst) {
        return Err(detail(StatusCode::INTERNAL_SERVER_ERROR, "disk full"));
    }
    state.notebooks.lock().unwrap().insert(name, body);
    Ok(Json(json!({ "message": "saved" })))
}

async fn delete_notebook(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
) -> Reply {
    match state.notebooks.lock().unwrap().remove(&name) {
        Some(_) => Ok(Json(json!({ "message": "deleted" }))),
        None => Err(detail(StatusCode::NOT_FOUND, "Notebook not found")),
    }
}

async fn kernel_status() -> Json<Value> {
    Json(json!({ "status": "idle" }))
}

async fn kernel_ok() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn execute(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    state.executes.fetch_add(1, Ordering::SeqCst);
    let code = body["code"].as_str().unwrap_or_default();
    Json(json!({
        "outputs": [
            { "output_type": "stream", "name": "stdout", "text": format!("ran: {}\n", code) }
        ]
    }))
}

async fn complete(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    let delay = *state.complete_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    let cursor = body["cursor_pos"].as_u64().unwrap_or(0);
    Json(json!({
        "completions": {
            "matches": ["print", "property"],
            "cursor_start": cursor.saturating_sub(2),
            "cursor_end": cursor,
        }
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<MockState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut push_rx = state.push.subscribe();

    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    state.received.lock().unwrap().push(value.clone());
                    for reply in replies_to(&value) {
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            pushed = push_rx.recv() => match pushed {
                Ok(text) if text == KICK => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

/// What the server answers on its own: streamed execution and file lists.
fn replies_to(event: &Value) -> Vec<String> {
    let data = &event["data"];
    let frame = |event: &str, data: Value| json!({ "event": event, "data": data }).to_string();
    match event["event"].as_str() {
        Some("execute_code") => {
            let index = data["cell_index"].clone();
            let chunk = |text: &str| {
                frame(
                    "execution_result",
                    json!({
                        "cell_index": index,
                        "status": "running",
                        "output": { "output_type": "stream", "name": "stdout", "text": text },
                        "append": true,
                    }),
                )
            };
            vec![
                frame(
                    "execution_result",
                    json!({ "cell_index": index, "status": "running" }),
                ),
                chunk("chunk 1\n"),
                chunk("chunk 2\n"),
                frame(
                    "execution_result",
                    json!({ "cell_index": index, "status": "completed" }),
                ),
            ]
        }
        Some("file_completion_request") => {
            let query = data["query"].as_str().unwrap_or_default();
            let files: Vec<&str> = FILES.into_iter().filter(|f| f.starts_with(query)).collect();
            vec![frame(
                "file_completion_response",
                json!({ "request_id": data["request_id"], "files": files }),
            )]
        }
        _ => Vec::new(),
    }
}

// ── Session helpers ─────────────────────────────────────────────────

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        autosave_delay: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(100),
        completion_timeout: Duration::from_millis(500),
        ..SessionConfig::default()
    }
}

/// Poll the session until `check` holds.
pub async fn wait_for_snapshot(
    handle: &SessionHandle,
    mut check: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = handle.snapshot().await.expect("session alive");
        if check(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "session never reached the expected state: {:#?}",
            snapshot
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Poll until `check` holds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(POLL).await;
    }
}

/// Next notice at `level`, skipping everything else.
pub async fn next_notice(events: &mut SessionEvents, level: NoticeLevel) -> Notification {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(SessionEvent::Notice(notice))) if notice.level == level => return notice,
            Ok(Some(_)) => {}
            Ok(None) => panic!("session ended before a {:?} notice", level),
            Err(_) => panic!("no {:?} notice within {:?}", level, WAIT),
        }
    }
}

pub fn sources(snapshot: &SessionSnapshot) -> Vec<String> {
    snapshot.cells.iter().map(|c| c.source_text()).collect()
}
