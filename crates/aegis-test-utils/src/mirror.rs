// mirror: an in-memory update mirror for integration testing.
//
// Serves whatever bytes tests insert, keyed by request path. Binds to
// 127.0.0.1:0 so every test can spin up its own isolated instance, and
// supports failing the next N requests to exercise retry paths.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};

#[derive(Clone)]
struct MirrorState {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_remaining: Arc<AtomicUsize>,
    hits: Arc<AtomicUsize>,
}

/// A mock update mirror for integration testing.
pub struct MockMirror {
    addr: SocketAddr,
    state: MirrorState,
    /// Handle to the background accept loop; dropped with the mirror.
    _task: tokio::task::JoinHandle<()>,
}

impl MockMirror {
    /// Start the mirror on a random local port.
    pub async fn start() -> Self {
        let state = MirrorState {
            files: Arc::new(Mutex::new(HashMap::new())),
            fail_remaining: Arc::new(AtomicUsize::new(0)),
            hits: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new().fallback(serve).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock mirror");
        let addr = listener.local_addr().expect("mirror local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            _task: task,
        }
    }

    /// Base URL suitable for a registry mirror list entry.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Publish bytes under a mirror path (no leading slash).
    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), bytes.into());
    }

    /// Remove a published path; subsequent requests get 404.
    pub fn remove(&self, path: &str) {
        self.state.files.lock().unwrap().remove(path);
    }

    /// Answer the next `n` requests with 500 regardless of path.
    pub fn fail_next(&self, n: usize) {
        self.state.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Total requests seen.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn serve(State(state): State<MirrorState>, uri: Uri) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);

    if state
        .fail_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let key = uri.path().trim_start_matches('/').to_owned();
    let bytes = state.files.lock().unwrap().get(&key).cloned();
    match bytes {
        Some(bytes) => (StatusCode::OK, bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
