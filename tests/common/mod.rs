//! Local HTTP file server and listener helpers for transfer tests.

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::StreamExt;
use rangeload::{TransferError, TransferListener, TransferRecord, TransferStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

const SERVE_PIECE: usize = 1024;

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct ServedFile {
    body: Vec<u8>,
    version: u32,
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub name: String,
    pub range: Option<String>,
    pub if_range: Option<String>,
}

#[derive(Default)]
pub struct ServerState {
    files: Mutex<HashMap<String, ServedFile>>,
    forced: Mutex<HashMap<String, StatusCode>>,
    omit_length: AtomicBool,
    piece_delay_ms: AtomicU64,
    requests: Mutex<Vec<SeenRequest>>,
}

/// A file server honouring `Range` and `If-Range`, shut down on drop.
pub struct TestServer {
    pub base_url: String,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/files/{name}", get(serve_file))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, name: &str) -> String {
        format!("{}/files/{}", self.base_url, name)
    }

    /// Publishes (or replaces) a file; every replacement gets a new ETag.
    pub fn put(&self, name: &str, body: Vec<u8>) {
        let mut files = self.state.files.lock().unwrap();
        let version = files.get(name).map(|f| f.version + 1).unwrap_or(1);
        files.insert(name.to_string(), ServedFile { body, version });
    }

    pub fn etag(&self, name: &str) -> String {
        let files = self.state.files.lock().unwrap();
        etag_of(files.get(name).unwrap().version)
    }

    pub fn force_status(&self, name: &str, status: StatusCode) {
        self.state
            .forced
            .lock()
            .unwrap()
            .insert(name.to_string(), status);
    }

    pub fn omit_length(&self, omit: bool) {
        self.state.omit_length.store(omit, Ordering::SeqCst);
    }

    /// Delay between 1 KiB body pieces.
    pub fn slow_down(&self, delay: Duration) {
        self.state
            .piece_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn requests_for(&self, name: &str) -> Vec<SeenRequest> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn etag_of(version: u32) -> String {
    format!("\"v{}\"", version)
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let range = header_value(header::RANGE);
    let if_range = header_value(header::IF_RANGE);
    state.requests.lock().unwrap().push(SeenRequest {
        name: name.clone(),
        range: range.clone(),
        if_range: if_range.clone(),
    });

    if let Some(status) = state.forced.lock().unwrap().get(&name) {
        return (*status, "forced").into_response();
    }

    let (body, etag) = {
        let files = state.files.lock().unwrap();
        match files.get(&name) {
            Some(file) => (file.body.clone(), etag_of(file.version)),
            None => return (StatusCode::NOT_FOUND, "no such file").into_response(),
        }
    };
    let len = body.len();

    let range_start = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok());
    let honour_range = if_range.as_deref().is_none_or(|token| token == etag);

    let (status, slice, content_range) = match range_start {
        Some(start) if honour_range => {
            if start >= len {
                return (StatusCode::RANGE_NOT_SATISFIABLE, "").into_response();
            }
            (
                StatusCode::PARTIAL_CONTENT,
                body[start..].to_vec(),
                Some(format!("bytes {}-{}/{}", start, len - 1, len)),
            )
        }
        _ => (StatusCode::OK, body, None),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::ETAG, etag.as_str());
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    let omit_length = state.omit_length.load(Ordering::SeqCst);
    let delay = Duration::from_millis(state.piece_delay_ms.load(Ordering::SeqCst));
    if !omit_length {
        builder = builder.header(header::CONTENT_LENGTH, slice.len());
    }

    let body = if omit_length || !delay.is_zero() {
        let pieces: Vec<Vec<u8>> = slice.chunks(SERVE_PIECE).map(<[u8]>::to_vec).collect();
        let stream = futures_util::stream::iter(pieces).then(move |piece| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, std::io::Error>(Bytes::from(piece))
        });
        Body::from_stream(stream)
    } else {
        Body::from(slice)
    };
    builder.body(body).unwrap()
}

/// What a listener observed, in delivery order.
#[derive(Debug, Clone)]
pub enum Seen {
    Start,
    Progress(TransferStatus, i64),
    Error(Option<TransferError>),
    Finish(PathBuf),
    Remove,
}

pub struct EventLog {
    tx: mpsc::UnboundedSender<Seen>,
}

pub fn event_log() -> (Arc<EventLog>, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(EventLog { tx }), rx)
}

impl TransferListener for EventLog {
    fn on_start(&self, _record: &TransferRecord) {
        let _ = self.tx.send(Seen::Start);
    }

    fn on_progress(&self, record: &TransferRecord) {
        let _ = self
            .tx
            .send(Seen::Progress(record.status, record.current_size));
    }

    fn on_error(&self, record: &TransferRecord) {
        let _ = self.tx.send(Seen::Error(record.error.clone()));
    }

    fn on_finish(&self, file: &std::path::Path, _record: &TransferRecord) {
        let _ = self.tx.send(Seen::Finish(file.to_path_buf()));
    }

    fn on_remove(&self, _record: &TransferRecord) {
        let _ = self.tx.send(Seen::Remove);
    }
}

/// Collects events until one matches `done`, failing the test after a timeout.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Seen>,
    mut done: impl FnMut(&Seen) -> bool,
) -> Vec<Seen> {
    let mut seen = Vec::new();
    let collected = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(event) = rx.recv().await {
            let hit = done(&event);
            seen.push(event);
            if hit {
                return true;
            }
        }
        false
    })
    .await;
    match collected {
        Ok(true) => seen,
        Ok(false) => panic!("event stream closed, saw {:?}", seen),
        Err(_) => panic!("timed out, saw {:?}", seen),
    }
}

pub fn is_finish(event: &Seen) -> bool {
    matches!(event, Seen::Finish(_))
}

pub fn is_error(event: &Seen) -> bool {
    matches!(event, Seen::Error(_))
}
