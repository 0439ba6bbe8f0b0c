//! In-memory collaborators for tests, in the spirit of the teacher's
//! `MockRegistry`/`MockExecutor` test doubles: enough behavior to drive the
//! navigator without a real browser or network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use spf_core_types::Response;
use spf_history::HistoryBackend;
use spf_request::{RequestEvent, RequestSpec, Transport};

pub use spf_core_types::fake::{InMemoryDom, InMemorySnapshotStore};

#[derive(Default)]
pub struct InMemoryHistoryBackend {
    pub pushed: Mutex<Vec<(String, Value)>>,
    pub replaced: Mutex<Vec<(String, Value)>>,
}

impl HistoryBackend for InMemoryHistoryBackend {
    fn push(&self, url: &str, state: Value) {
        self.pushed.lock().push((url.to_string(), state));
    }

    fn replace(&self, url: &str, state: Value) {
        self.replaced.lock().push((url.to_string(), state));
    }
}

/// One canned response (or error) per URL, consumed in FIFO order when that
/// URL is requested more than once.
pub struct ScriptedTransport {
    responses: Mutex<std::collections::HashMap<String, VecDeque<ScriptedOutcome>>>,
}

pub enum ScriptedOutcome {
    Parts(Vec<Response>),
    Error(String),
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            responses: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, url: impl Into<String>, parts: Vec<Response>) {
        self.responses
            .lock()
            .entry(url.into())
            .or_default()
            .push_back(ScriptedOutcome::Parts(parts));
    }

    pub fn push_error(&self, url: impl Into<String>, message: impl Into<String>) {
        self.responses
            .lock()
            .entry(url.into())
            .or_default()
            .push_back(ScriptedOutcome::Error(message.into()));
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, spec: RequestSpec, tx: mpsc::Sender<RequestEvent>) {
        let outcome = {
            let mut guard = self.responses.lock();
            guard.get_mut(&spec.url).and_then(|q| q.pop_front())
        };
        let _ = tx.send(RequestEvent::Headers { status: 200 }).await;
        match outcome {
            Some(ScriptedOutcome::Parts(parts)) => {
                for part in parts {
                    if tx.send(RequestEvent::Part(part)).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(RequestEvent::Success).await;
            }
            Some(ScriptedOutcome::Error(message)) => {
                let _ = tx
                    .send(RequestEvent::Error(spf_core_types::SpfError::transport(message)))
                    .await;
            }
            None => {
                let _ = tx
                    .send(RequestEvent::Error(spf_core_types::SpfError::transport(format!(
                        "no scripted response for {}",
                        spec.url
                    ))))
                    .await;
            }
        }
    }
}

/// A transport that blocks mid-request until released, so a test can arrange
/// for a second navigation to observe (and promote) a still-in-flight one.
/// Counts invocations so a test can assert promotion skipped a duplicate
/// request.
pub struct GatedTransport {
    calls: AtomicUsize,
    started: Notify,
    release: Notify,
    response: Response,
}

impl GatedTransport {
    pub fn new(response: Response) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            release: Notify::new(),
            response,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolves once `request` has been entered at least once.
    pub async fn wait_until_started(&self) {
        self.started.notified().await;
    }

    /// Unblocks every in-flight (and the next) call to `request`.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait::async_trait]
impl Transport for GatedTransport {
    async fn request(&self, _spec: RequestSpec, tx: mpsc::Sender<RequestEvent>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(RequestEvent::Headers { status: 200 }).await;
        self.started.notify_one();
        self.release.notified().await;
        let _ = tx.send(RequestEvent::Part(self.response.clone())).await;
        let _ = tx.send(RequestEvent::Success).await;
    }
}

pub fn dom() -> Arc<InMemoryDom> {
    Arc::new(InMemoryDom::new())
}

pub fn snapshot_store() -> Arc<InMemorySnapshotStore> {
    Arc::new(InMemorySnapshotStore::new())
}
