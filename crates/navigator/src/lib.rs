//! The per-navigation state machine: IDLE → REQUESTING → PROCESSING →
//! APPLYING → DONE, with ERROR terminal and PREFETCHING a parallel track
//! that can be promoted into the current navigation.
//!
//! This is the root of the dependency graph among the other crates: it
//! drives the request layer, feeds parts to the applier, mediates the
//! cache, and updates history on success.

mod diagnostics;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::info;

use spf_cache::{CacheConfig, Lifetime, ResponseCache};
use spf_core_types::{now_ms, CacheKind, ErrorKind, NavigationKind, Response, SnapshotStore, SpfError};
use spf_dispatcher::Dispatcher;
use spf_history::HistoryBinding;
use spf_request::{Method, RequestEvent, RequestSpec, Transport};
use spf_task_queue::TaskQueueManager;
use spf_applier::{ApplyOutcome, Applier};

pub use diagnostics::{DiagnosticEvent, InMemoryDiagnostics, NavigatorDiagnostics, NoopDiagnostics};
pub use spf_cache as cache;
pub use spf_request as request;

/// What a navigation attempt resolved to, from the caller's point of view.
#[derive(Debug, Clone)]
pub enum NavigationOutcome {
    Completed { url: String },
    /// The navigation was not performed as an SPA transition — the caller
    /// (the host embedding this library) must perform an ordinary full-page
    /// load to `url` itself, since there is no real browser here to do it
    /// automatically. Only transport/timeout/parse failures (and the
    /// session cap / cross-origin guards) produce this; see `Failed` for
    /// errors that must not fall back.
    FullPageLoad { url: String, reason: SpfError },
    /// An error that must not trigger a full-page fallback (apply errors:
    /// the partial DOM state is left in place and later parts still apply).
    Failed { url: String, reason: SpfError },
}

pub struct NavigatorConfig {
    pub url_identifier: String,
    pub request_timeout_ms: u64,
    pub multipart_delimiter: String,
    pub navigate_limit: Option<u32>,
    pub navigate_lifetime_ms: u64,
    pub origin: Option<String>,
    /// Yields to the runtime after each applied part instead of draining
    /// the whole stream in one poll, so other tasks get a turn between
    /// fragments of a long response.
    pub process_async: bool,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            url_identifier: "?spf=__type__".to_string(),
            request_timeout_ms: 8_000,
            multipart_delimiter: "\r\n".to_string(),
            navigate_limit: None,
            navigate_lifetime_ms: 30 * 60 * 1000,
            origin: None,
            process_async: false,
        }
    }
}

/// Splits `url + identifier` per the URL-identification algorithm: preserve
/// the fragment, substitute `__type__`, and join with `&` instead of a
/// second leading `?` when the URL already has a query string.
pub fn identify(url: &str, kind: NavigationKind, identifier: &str) -> String {
    let (base, fragment) = match url.split_once('#') {
        Some((b, f)) => (b.to_string(), Some(f.to_string())),
        None => (url.to_string(), None),
    };
    let substituted = identifier.replace("__type__", kind.as_str());
    let joined = if substituted.starts_with('?') && base.contains('?') {
        format!("{base}&{}", &substituted[1..])
    } else {
        format!("{base}{substituted}")
    };
    match fragment {
        Some(fragment) => format!("{joined}#{fragment}"),
        None => joined,
    }
}

const SNAPSHOT_NAMESPACE: &str = "spf:session-cap";

#[derive(serde::Serialize, serde::Deserialize)]
struct SessionCapSnapshot {
    count: u32,
    window_start_ms: u64,
}

/// Tracks how many navigations have completed in the current window, mirrored
/// into the snapshot store so the count survives a process restart the way
/// the source's `sessionStorage`-backed counter does.
struct SessionCap {
    count: AtomicU32,
    window_start_ms: AtomicU64,
    snapshot: Option<Arc<dyn SnapshotStore>>,
}

impl SessionCap {
    fn new(snapshot: Option<Arc<dyn SnapshotStore>>) -> Self {
        let restored = snapshot
            .as_ref()
            .and_then(|store| store.read(SNAPSHOT_NAMESPACE))
            .and_then(|value| serde_json::from_value::<SessionCapSnapshot>(value).ok());
        let (count, window_start_ms) = match restored {
            Some(snap) => (snap.count, snap.window_start_ms),
            None => (0, now_ms()),
        };
        Self {
            count: AtomicU32::new(count),
            window_start_ms: AtomicU64::new(window_start_ms),
            snapshot,
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.snapshot {
            let snap = SessionCapSnapshot {
                count: self.count.load(Ordering::Relaxed),
                window_start_ms: self.window_start_ms.load(Ordering::Relaxed),
            };
            if let Ok(value) = serde_json::to_value(&snap) {
                store.write(SNAPSHOT_NAMESPACE, value);
            }
        }
    }

    fn reached(&self, limit: Option<u32>, lifetime_ms: u64) -> bool {
        let Some(limit) = limit else { return false };
        let start = self.window_start_ms.load(Ordering::Relaxed);
        if now_ms().saturating_sub(start) >= lifetime_ms {
            self.count.store(0, Ordering::Relaxed);
            self.window_start_ms.store(now_ms(), Ordering::Relaxed);
            self.persist();
            return false;
        }
        self.count.load(Ordering::Relaxed) >= limit
    }

    fn record_success(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.persist();
    }
}

struct InFlight {
    kind: Mutex<NavigationKind>,
    cancelled: Arc<AtomicBool>,
    /// Resolves once the request driving this entry finishes, so a
    /// navigation that promotes an in-flight prefetch can await the same
    /// result instead of issuing a second request.
    outcome: watch::Sender<Option<NavigationOutcome>>,
}

/// Wires cache, resources, request, applier, and history into the full
/// navigation state machine. `Send + Sync`: every shared resource is
/// `Arc`/lock-guarded so one `Navigator` can be driven from many tasks.
pub struct Navigator {
    config: parking_lot::RwLock<NavigatorConfig>,
    cache: Arc<ResponseCache>,
    queues: TaskQueueManager,
    dispatcher: Arc<Dispatcher>,
    applier: Arc<Applier>,
    history: Arc<HistoryBinding>,
    transport: Arc<dyn Transport>,
    session: SessionCap,
    current_navigate: Mutex<Option<String>>,
    inflight: DashMap<String, Arc<InFlight>>,
    diagnostics: Arc<dyn NavigatorDiagnostics>,
}

impl Navigator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NavigatorConfig,
        cache_config: CacheConfig,
        queues: TaskQueueManager,
        dispatcher: Arc<Dispatcher>,
        applier: Arc<Applier>,
        history: Arc<HistoryBinding>,
        transport: Arc<dyn Transport>,
        snapshot: Arc<dyn SnapshotStore>,
        diagnostics: Arc<dyn NavigatorDiagnostics>,
    ) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
            cache: Arc::new(ResponseCache::with_snapshot_store(cache_config, Some(snapshot.clone()))),
            queues,
            dispatcher,
            applier,
            history,
            transport,
            session: SessionCap::new(Some(snapshot)),
            current_navigate: Mutex::new(None),
            inflight: DashMap::new(),
            diagnostics,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub async fn navigate(&self, url: &str) -> NavigationOutcome {
        self.start(url, NavigationKind::Navigate).await
    }

    pub async fn prefetch(&self, url: &str) -> NavigationOutcome {
        self.start(url, NavigationKind::Prefetch).await
    }

    pub async fn load(&self, url: &str) -> NavigationOutcome {
        self.start(url, NavigationKind::Load).await
    }

    /// Feeds a response the caller already has (e.g. handed in directly,
    /// bypassing the request layer) through the applier as a single,
    /// complete part.
    pub async fn process(&self, url: &str, response: Response) -> NavigationOutcome {
        let queue_key = format!("navigate-{url}");
        self.dispatcher.publish("spf_process", &vec![json!(url)]);
        match self.applier.apply_part(&queue_key, &response, true).await {
            ApplyOutcome::Redirect(target) => self.navigate(&target).await,
            ApplyOutcome::Applied => {
                self.cache.set(
                    response.url.clone().unwrap_or_else(|| url.to_string()).as_str(),
                    response,
                    CacheKind::Navigate,
                    Lifetime::Default,
                );
                NavigationOutcome::Completed { url: url.to_string() }
            }
        }
    }

    /// A back/forward pop arrived from the history binding; re-drives the
    /// navigation for the popped URL without pushing a new history entry.
    pub async fn navigate_from_pop(&self, url: &str, back: bool) -> NavigationOutcome {
        info!(%url, back, "history pop reclassified as navigation");
        let kind = if back { NavigationKind::Back } else { NavigationKind::Forward };
        self.start(url, kind).await
    }

    fn cancel(&self, url: &str) {
        if let Some((_, inflight)) = self.inflight.remove(url) {
            inflight.cancelled.store(true, Ordering::SeqCst);
        }
        self.queues.cancel_all_except(&format!("navigate-{url}"), "");
    }

    fn record(&self, label: &str, url: &str) {
        self.diagnostics.record(DiagnosticEvent::new(label, url));
    }

    /// Awaits the outcome of an already in-flight request that this
    /// navigation just promoted to `Navigate`, rather than issuing a
    /// second `spf_request` and a duplicate transport call.
    async fn await_inflight(inflight: Arc<InFlight>) -> NavigationOutcome {
        let mut rx = inflight.outcome.subscribe();
        if let Some(outcome) = rx.borrow().clone() {
            return outcome;
        }
        loop {
            if rx.changed().await.is_err() {
                return NavigationOutcome::Failed {
                    url: String::new(),
                    reason: SpfError::apply("in-flight navigation was dropped before completing"),
                };
            }
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
        }
    }

    async fn start(&self, url: &str, kind: NavigationKind) -> NavigationOutcome {
        if matches!(kind, NavigationKind::Navigate)
            && self.session.reached(self.config.read().navigate_limit, self.config.read().navigate_lifetime_ms)
        {
            self.record("session-cap-reached", url);
            return NavigationOutcome::FullPageLoad {
                url: url.to_string(),
                reason: SpfError::limit("navigate-limit reached for this session"),
            };
        }

        if let Some(origin) = self.config.read().origin.clone() {
            if matches!(kind, NavigationKind::Navigate) && !same_origin(url, &origin) {
                return NavigationOutcome::FullPageLoad {
                    url: url.to_string(),
                    reason: SpfError::origin("navigate target is cross-origin"),
                };
            }
        }

        // Promotion: an in-flight prefetch for this exact URL becomes the
        // current navigation instead of issuing a second request.
        let promoted = if matches!(kind, NavigationKind::Navigate) {
            self.inflight.get(url).map(|entry| {
                *entry.kind.lock() = NavigationKind::Navigate;
                entry.clone()
            })
        } else {
            None
        };

        if matches!(kind, NavigationKind::Navigate) {
            let previous = self.current_navigate.lock().replace(url.to_string());
            if let Some(previous) = previous {
                if previous != url {
                    self.cancel(&previous);
                }
            }
        }

        if let Some(inflight) = promoted {
            self.record("promoted", url);
            return Self::await_inflight(inflight).await;
        }

        let cache_kind = match kind {
            NavigationKind::Prefetch => CacheKind::Prefetch,
            _ => CacheKind::Navigate,
        };

        if let Some(cached) = self.cache.get(url, Some(cache_kind)) {
            self.dispatcher.publish("spf_request", &vec![json!(url)]);
            self.dispatcher.publish("spf_received", &vec![json!(url)]);
            return self.apply_final(url, kind, cached, true).await;
        }

        let (outcome_tx, _) = watch::channel(None);
        let inflight = Arc::new(InFlight {
            kind: Mutex::new(kind),
            cancelled: Arc::new(AtomicBool::new(false)),
            outcome: outcome_tx,
        });
        self.inflight.insert(url.to_string(), inflight.clone());

        self.dispatcher.publish("spf_request", &vec![json!(url)]);
        self.record("request", url);

        let identifier = self.config.read().url_identifier.clone();
        let identified_url = identify(url, kind, &identifier);
        let timeout_ms = self.config.read().request_timeout_ms;
        let delimiter = self.config.read().multipart_delimiter.clone();

        let (tx, rx) = mpsc::channel(32);
        let transport = self.transport.clone();
        let spec = RequestSpec {
            url: identified_url,
            method: Method::Get,
            post_data: None,
            timeout_ms,
            delimiter,
        };
        tokio::spawn(async move {
            transport.request(spec, tx).await;
        });

        let result = self.drive(url, kind, inflight.clone(), rx).await;
        self.inflight.remove(url);
        let _ = inflight.outcome.send(Some(result.clone()));
        result
    }

    /// Drains request events for one in-flight navigation, applying parts
    /// as they arrive (unless the navigation is still only a prefetch, in
    /// which case they're accumulated) and returning the terminal outcome.
    async fn drive(
        &self,
        url: &str,
        started_as: NavigationKind,
        inflight: Arc<InFlight>,
        mut rx: mpsc::Receiver<RequestEvent>,
    ) -> NavigationOutcome {
        let process_async = self.config.read().process_async;
        let queue_key = format!("navigate-{url}");
        let mut accumulated: Option<Response> = None;
        let mut failure: Option<SpfError> = None;
        let mut received_first = false;
        let mut applied_any = false;

        while let Some(event) = rx.recv().await {
            if inflight.cancelled.load(Ordering::SeqCst) {
                break;
            }
            match event {
                RequestEvent::Headers { .. } => {}
                RequestEvent::Part(part) => {
                    if !received_first {
                        self.dispatcher.publish("spf_received", &vec![json!(url)]);
                        received_first = true;
                    }
                    self.dispatcher.publish("spf_part_received", &vec![json!(url)]);

                    let effective_kind = *inflight.kind.lock();
                    if matches!(effective_kind, NavigationKind::Prefetch) {
                        accumulated = Some(merge_response(accumulated, part));
                    } else {
                        if !applied_any {
                            // Promoted mid-stream: catch up on whatever arrived
                            // while this was still a prefetch before applying
                            // the part that triggered this branch.
                            if let Some(pending) = accumulated.take() {
                                match self.applier.apply_part(&queue_key, &pending, false).await {
                                    ApplyOutcome::Redirect(target) => {
                                        self.inflight.remove(url);
                                        return Box::pin(self.start(&target, started_as)).await;
                                    }
                                    ApplyOutcome::Applied => {
                                        accumulated = Some(pending);
                                    }
                                }
                            }
                        }
                        match self.applier.apply_part(&queue_key, &part, false).await {
                            ApplyOutcome::Redirect(target) => {
                                self.inflight.remove(url);
                                return Box::pin(self.start(&target, started_as)).await;
                            }
                            ApplyOutcome::Applied => {
                                applied_any = true;
                                self.dispatcher.publish("spf_part_process", &vec![json!(url)]);
                                accumulated = Some(merge_response(accumulated, part));
                            }
                        }
                    }
                    if process_async {
                        tokio::task::yield_now().await;
                    }
                }
                RequestEvent::Success => break,
                RequestEvent::Error(err) => {
                    failure = Some(err);
                    break;
                }
                RequestEvent::Timeout => {
                    failure = Some(SpfError::timeout(format!("{url} timed out")).retriable(true));
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.dispatcher
                .publish("spf_error", &vec![json!(url), json!(err.kind.to_string())]);
            self.record("error", url);
            return match err.kind {
                ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Parse => {
                    NavigationOutcome::FullPageLoad { url: url.to_string(), reason: err }
                }
                _ => NavigationOutcome::Failed { url: url.to_string(), reason: err },
            };
        }

        let effective_kind = *inflight.kind.lock();
        let response = accumulated.unwrap_or_default();
        self.apply_final(url, effective_kind, response, !applied_any).await
    }

    /// Applies the final, fully-merged response. `needs_apply` is `false`
    /// when every part was already applied incrementally during streaming
    /// (so re-applying the merge here would double-apply); in that case
    /// only the `spf_done` signal still fires.
    async fn apply_final(
        &self,
        url: &str,
        kind: NavigationKind,
        response: Response,
        needs_apply: bool,
    ) -> NavigationOutcome {
        let cache_kind = match kind {
            NavigationKind::Prefetch => CacheKind::Prefetch,
            _ => CacheKind::Navigate,
        };
        let canonical = response.url.clone().unwrap_or_else(|| url.to_string());

        if matches!(kind, NavigationKind::Prefetch) {
            self.cache.set(&canonical, response, cache_kind, Lifetime::Default);
            return NavigationOutcome::Completed { url: url.to_string() };
        }

        let queue_key = format!("navigate-{url}");
        if needs_apply {
            match self.applier.apply_part(&queue_key, &response, true).await {
                ApplyOutcome::Redirect(target) => return Box::pin(self.start(&target, kind)).await,
                ApplyOutcome::Applied => {}
            }
        } else {
            self.dispatcher.publish("spf_done", &vec![]);
        }

        self.cache.set(&canonical, response, cache_kind, Lifetime::Default);

        if kind.advances_history() {
            self.history.add(url, json!({}), true);
            self.session.record_success();
        }

        self.record("done", url);
        NavigationOutcome::Completed { url: url.to_string() }
    }
}

fn merge_response(base: Option<Response>, part: Response) -> Response {
    let Some(mut base) = base else { return part };
    if part.title.is_some() {
        base.title = part.title;
    }
    if part.url.is_some() {
        base.url = part.url;
    }
    if part.cache_type.is_some() {
        base.cache_type = part.cache_type;
    }
    if part.cache_key.is_some() {
        base.cache_key = part.cache_key;
    }
    base.attr.extend(part.attr);
    if part.head.is_some() {
        base.head = part.head;
    }
    base.body.extend(part.body);
    if part.foot.is_some() {
        base.foot = part.foot;
    }
    if part.redirect.is_some() {
        base.redirect = part.redirect;
    }
    base.timing.extend(part.timing);
    base
}

fn same_origin(url: &str, origin: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.origin().ascii_serialization() == origin,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_preserves_fragment_and_joins_query() {
        assert_eq!(identify("/p", NavigationKind::Navigate, "?spf=__type__"), "/p?spf=navigate");
        assert_eq!(identify("/p?a=1", NavigationKind::Prefetch, "?spf=__type__"), "/p?a=1&spf=prefetch");
        assert_eq!(identify("/p#x", NavigationKind::Navigate, "?spf=__type__"), "/p?spf=navigate#x");
    }

    #[test]
    fn session_cap_blocks_once_limit_reached() {
        let cap = SessionCap::new(None);
        assert!(!cap.reached(Some(1), 60_000));
        cap.record_success();
        assert!(cap.reached(Some(1), 60_000));
    }

    #[test]
    fn session_cap_resets_once_window_lifetime_is_zero() {
        let cap = SessionCap::new(None);
        cap.record_success();
        // A zero-length lifetime is always considered elapsed, so the
        // window resets on every check and the cap never engages.
        assert!(!cap.reached(Some(1), 0));
    }

    #[test]
    fn session_cap_persists_across_instances_via_snapshot_store() {
        use spf_core_types::fake::InMemorySnapshotStore;
        let store: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
        let first = SessionCap::new(Some(store.clone()));
        first.record_success();

        let restored = SessionCap::new(Some(store));
        assert!(restored.reached(Some(1), 60_000));
    }
}
