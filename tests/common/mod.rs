//! Shared fixtures for the integration tests: an in-process push endpoint,
//! a recording WAL consumer and simple markers.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use chrono::Utc;
use logship::client::push::{decode_push_request, PushRequest, TENANT_HEADER};
use logship::marker::MarkerHandle;
use logship::wal::{AppendError, Entry, LabelSet, Marker, RefEntries, RefSeries, WriteCleanup, WriteTo};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const PUSH_PATH: &str = "/loki/api/v1/push";

pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn entry(line: &str) -> Entry {
    Entry::new(Utc::now(), line)
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedPush {
    pub tenant: Option<String>,
    pub request: PushRequest,
}

#[derive(Default)]
struct ServerState {
    /// Statuses answered in order; 204 once exhausted.
    script: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<ReceivedPush>>,
    attempts: AtomicUsize,
}

/// Push endpoint on an ephemeral local port.
pub struct FakePushServer {
    pub addr: SocketAddr,
    state: std::sync::Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

async fn handle_push(
    State(state): State<std::sync::Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    let scripted = state.script.lock().unwrap().pop_front();
    let status = StatusCode::from_u16(scripted.unwrap_or(204)).unwrap();
    if !status.is_success() {
        return (status, "push rejected\nsecond line".to_string());
    }

    let request = match decode_push_request(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()),
    };
    let tenant = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state
        .requests
        .lock()
        .unwrap()
        .push(ReceivedPush { tenant, request });
    (status, String::new())
}

impl FakePushServer {
    pub async fn start() -> Self {
        let state = std::sync::Arc::new(ServerState::default());
        let app = Router::new()
            .route(PUSH_PATH, post(handle_push))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|&v| v).await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, PUSH_PATH)
    }

    /// Answers the next pushes with `statuses`, in order.
    pub fn script(&self, statuses: &[u16]) {
        self.state
            .script
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    /// Every push attempt, accepted or not.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ReceivedPush> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Lines of all accepted pushes in arrival order.
    pub fn lines(&self) -> Vec<String> {
        self.requests()
            .iter()
            .flat_map(|push| push.request.streams.iter())
            .flat_map(|stream| stream.values.iter().map(|[_, line]| line.clone()))
            .collect()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Keeps everything a watcher hands over. Optionally holds appends until
/// the gate opens.
pub struct RecordingWriteTo {
    series: Mutex<HashMap<u64, LabelSet>>,
    lines: Mutex<Vec<(i64, String)>>,
    resets: Mutex<Vec<i64>>,
    gate: watch::Sender<bool>,
    pub appends_started: AtomicUsize,
}

impl RecordingWriteTo {
    pub fn new() -> Self {
        Self::with_gate(true)
    }

    /// Appends block until [`RecordingWriteTo::open_gate`] is called.
    pub fn gated() -> Self {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            lines: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            gate: watch::channel(open).0,
            appends_started: AtomicUsize::new(0),
        }
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn segments(&self) -> Vec<i64> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|(segment, _)| *segment)
            .collect()
    }

    pub fn series_labels(&self, series_ref: u64) -> Option<LabelSet> {
        self.series.lock().unwrap().get(&series_ref).cloned()
    }

    pub fn resets(&self) -> Vec<i64> {
        self.resets.lock().unwrap().clone()
    }
}

impl WriteCleanup for RecordingWriteTo {
    fn series_reset(&self, segment: i64) {
        self.resets.lock().unwrap().push(segment);
    }
}

#[async_trait]
impl WriteTo for RecordingWriteTo {
    fn store_series(&self, series: &[RefSeries], _segment: i64) {
        let mut known = self.series.lock().unwrap();
        for s in series {
            known.insert(s.series_ref, s.labels.clone());
        }
    }

    async fn append_entries(&self, entries: RefEntries, segment: i64) -> Result<(), AppendError> {
        self.appends_started.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut lines = self.lines.lock().unwrap();
        for e in entries.entries {
            lines.push((segment, e.line));
        }
        Ok(())
    }
}

/// Marker pinned to one segment.
pub struct FixedMarker(pub i64);

impl Marker for FixedMarker {
    fn last_marked_segment(&self) -> i64 {
        self.0
    }
}

/// Counts received and sent entries per segment.
#[derive(Default)]
pub struct RecordingMarker {
    received: Mutex<HashMap<i64, i64>>,
    sent: Mutex<HashMap<i64, i64>>,
    pub stopped: AtomicBool,
}

impl RecordingMarker {
    pub fn received(&self, segment: i64) -> i64 {
        self.received.lock().unwrap().get(&segment).copied().unwrap_or(0)
    }

    pub fn sent(&self, segment: i64) -> i64 {
        self.sent.lock().unwrap().get(&segment).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MarkerHandle for RecordingMarker {
    fn update_received_data(&self, segment: i64, count: i64) {
        *self.received.lock().unwrap().entry(segment).or_default() += count;
    }

    fn update_sent_data(&self, segment: i64, count: i64) {
        *self.sent.lock().unwrap().entry(segment).or_default() += count;
    }

    fn last_marked_segment(&self) -> i64 {
        -1
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
