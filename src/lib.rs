//! SPF: a client-side navigation framework that turns an ordinarily
//! full-page-reload website into a single-page application without
//! requiring the site to be restructured.
//!
//! The public surface is the [`Spf`] facade. Everything it needs from the
//! host environment — the DOM, the History API, the network — is expressed
//! as a trait ([`Dom`], [`HistoryBackend`], [`Transport`]) so the library
//! itself stays free of any particular browser embedding and is fully
//! testable with the in-memory fakes under [`testing`].

pub mod config;
pub mod testing;

use std::sync::Arc;

pub use spf_cache::{CacheConfig, Lifetime, ResponseCache};
pub use spf_core_types::{
    now_ms, CacheKind, Dom, ElementHandle, ErrorKind, NavigationKind, Response, ResourceKind, SnapshotStore, SpfError,
};
pub use spf_dispatcher::{Args, Dispatcher, SubscriptionId};
pub use spf_history::{HistoryBackend, PopOutcome};
pub use spf_navigator::{
    identify, DiagnosticEvent, InMemoryDiagnostics, NavigationOutcome, Navigator, NavigatorConfig, NavigatorDiagnostics,
    NoopDiagnostics,
};
pub use spf_request::{Method, RequestEvent, RequestSpec, ReqwestTransport, Transport};
pub use spf_resources::{Callback as ResourceCallback, PathRules, ResourceLoader};
pub use spf_task_queue::{Task, TaskQueueManager};

use config::SpfConfig;
use spf_applier::Applier;
use spf_history::HistoryBinding;

/// Scoped view over one resource kind (scripts or styles), so callers get
/// `spf.scripts().load(...)` / `spf.styles().load(...)` instead of passing
/// the kind by hand at every call site.
pub struct ResourceKindHandle {
    loader: Arc<ResourceLoader>,
    kind: ResourceKind,
}

impl ResourceKindHandle {
    pub async fn load(&self, urls: &[String], name: Option<String>, callback: Option<ResourceCallback>) {
        self.loader.load(self.kind, urls, name, callback).await;
    }

    pub fn unload(&self, name: &str) {
        self.loader.unload(self.kind, name);
    }

    pub fn prefetch(&self, url: &str) {
        self.loader.prefetch(self.kind, url);
    }

    pub fn discover(&self) {
        self.loader.discover(self.kind);
    }
}

/// The navigation framework instance. Owns every component and exposes the
/// public surface: `navigate`, `load`, `prefetch`, `process`, the resource
/// loaders, and the pub/sub dispatcher.
pub struct Spf {
    navigator: Arc<Navigator>,
    resources: Arc<ResourceLoader>,
    dispatcher: Arc<Dispatcher>,
    queues: TaskQueueManager,
    dom: Arc<dyn Dom>,
}

impl Spf {
    /// Builds a new instance. `initial_url` seeds the history binding's
    /// replace-state entry, matching initialization in the history
    /// component. Returns an error only if the provided collaborators
    /// themselves fail validation (reserved for future use; currently
    /// always succeeds).
    pub fn new(
        config: SpfConfig,
        dom: Arc<dyn Dom>,
        history_backend: Arc<dyn HistoryBackend>,
        transport: Arc<dyn Transport>,
        snapshot: Arc<dyn SnapshotStore>,
        diagnostics: Arc<dyn NavigatorDiagnostics>,
        initial_url: &str,
    ) -> Result<Self, SpfError> {
        let dispatcher = Arc::new(Dispatcher::new());
        let queues = TaskQueueManager::new();
        let resources = Arc::new(ResourceLoader::new(dom.clone()));
        let applier = Arc::new(Applier::new(
            dom.clone(),
            resources.clone(),
            queues.clone(),
            dispatcher.clone(),
        ));
        let history = Arc::new(HistoryBinding::new(history_backend, initial_url));

        let navigator_config = NavigatorConfig {
            url_identifier: config.url_identifier.clone(),
            request_timeout_ms: config.request_timeout_ms,
            multipart_delimiter: config.multipart_delimiter.clone(),
            navigate_limit: config.navigate_limit,
            navigate_lifetime_ms: config.navigate_lifetime_ms,
            origin: config.origin.clone(),
            process_async: config.process_async,
        };
        let cache_config = CacheConfig {
            lifetime_ms: config.cache_lifetime_ms,
            max_entries: config.cache_max,
            unified: config.cache_unified,
            session_storage: config.cache_session_storage,
        };

        let navigator = Arc::new(Navigator::new(
            navigator_config,
            cache_config,
            queues.clone(),
            dispatcher.clone(),
            applier,
            history,
            transport,
            snapshot,
            diagnostics,
        ));

        Ok(Self {
            navigator,
            resources,
            dispatcher,
            queues,
            dom,
        })
    }

    pub async fn navigate(&self, url: &str) -> NavigationOutcome {
        self.navigator.navigate(url).await
    }

    pub async fn load(&self, url: &str) -> NavigationOutcome {
        self.navigator.load(url).await
    }

    pub async fn prefetch(&self, url: &str) -> NavigationOutcome {
        self.navigator.prefetch(url).await
    }

    pub async fn process(&self, url: &str, response: Response) -> NavigationOutcome {
        self.navigator.process(url, response).await
    }

    /// Re-drives the navigator for a browser pop event already classified
    /// by the history binding.
    pub async fn navigate_from_pop(&self, url: &str, back: bool) -> NavigationOutcome {
        self.navigator.navigate_from_pop(url, back).await
    }

    pub fn scripts(&self) -> ResourceKindHandle {
        ResourceKindHandle {
            loader: self.resources.clone(),
            kind: ResourceKind::Script,
        }
    }

    pub fn styles(&self) -> ResourceKindHandle {
        ResourceKindHandle {
            loader: self.resources.clone(),
            kind: ResourceKind::Style,
        }
    }

    pub fn subscribe(&self, topic: &str, listener: impl Fn(&str, &Args) + Send + Sync + 'static) -> SubscriptionId {
        self.dispatcher.subscribe(topic, listener)
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        self.dispatcher.unsubscribe(topic, id);
    }

    pub fn cache(&self) -> &ResponseCache {
        self.navigator.cache()
    }

    pub fn dom(&self) -> &Arc<dyn Dom> {
        &self.dom
    }

    /// Tears down outstanding task queues. There is no real "other version"
    /// of a compiled Rust crate to hand continuity off to, so unlike the
    /// source's cross-version `_spf_state` slot, dispose here simply
    /// releases this instance's resources.
    pub fn dispose(&self) {
        self.queues.cancel_all_except("navigate-", "");
    }
}
