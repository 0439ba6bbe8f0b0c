#![allow(dead_code)]

//! Shared identifiers, error type, and small enums used across every SPF crate.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use uuid::Uuid;

/// Kind discriminant carried on every `SpfError`; mirrors the error taxonomy in the spec's
/// error-handling section.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Timeout,
    Transport,
    Parse,
    Apply,
    Unsupported,
    Limit,
    Origin,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Parse => "parse",
            ErrorKind::Apply => "apply",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Limit => "limit",
            ErrorKind::Origin => "origin",
        };
        f.write_str(s)
    }
}

/// The single error type threaded through every component.
#[derive(Debug, Error, Clone)]
#[error("{kind}: {hint}")]
pub struct SpfError {
    pub kind: ErrorKind,
    pub hint: String,
    pub retriable: bool,
}

impl SpfError {
    pub fn new(kind: ErrorKind, hint: impl Into<String>) -> Self {
        Self {
            kind,
            hint: hint.into(),
            retriable: false,
        }
    }

    pub fn retriable(mut self, value: bool) -> Self {
        self.retriable = value;
        self
    }

    pub fn timeout(hint: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, hint)
    }

    pub fn transport(hint: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, hint)
    }

    pub fn parse(hint: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, hint)
    }

    pub fn apply(hint: impl Into<String>) -> Self {
        Self::new(ErrorKind::Apply, hint)
    }

    pub fn unsupported(hint: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, hint)
    }

    pub fn limit(hint: impl Into<String>) -> Self {
        Self::new(ErrorKind::Limit, hint)
    }

    pub fn origin(hint: impl Into<String>) -> Self {
        Self::new(ErrorKind::Origin, hint)
    }
}

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(NavigationId);
id_type!(ResourceId);

/// The kind of navigation request in flight; also used to fill `__type__` in the URL identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NavigationKind {
    Navigate,
    Prefetch,
    Load,
    Back,
    Forward,
    Reload,
}

impl NavigationKind {
    /// String used to replace `__type__` in the configured url-identifier, per §6.
    pub fn as_str(self) -> &'static str {
        match self {
            NavigationKind::Navigate => "navigate",
            NavigationKind::Prefetch => "prefetch",
            NavigationKind::Load => "load",
            NavigationKind::Back => "back",
            NavigationKind::Forward => "forward",
            NavigationKind::Reload => "reload",
        }
    }

    /// Whether this kind of navigation advances browser history on success.
    pub fn advances_history(self) -> bool {
        matches!(self, NavigationKind::Navigate | NavigationKind::Reload)
    }
}

impl fmt::Display for NavigationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distinguishes cached prefetch entries from cached navigate entries (§4.C).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CacheKind {
    Prefetch,
    Navigate,
}

/// Resource kind for the loader: scripts execute and gate progress, styles do not.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ResourceKind {
    Script,
    Style,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Script => "script",
            ResourceKind::Style => "style",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progressively populated timing bag, mirrored onto `Response.timing`.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Timing(pub HashMap<String, u64>);

impl Timing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, label: &str) {
        self.0.insert(label.to_string(), now_ms());
    }

    pub fn get(&self, label: &str) -> Option<u64> {
        self.0.get(label).copied()
    }
}

/// A script or style reference inside a `head`/`foot` block.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `head`/`foot` block: inline styles plus ordered script/style references.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<ResourceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub styles: Vec<ResourceRef>,
}

/// One server response: either a complete single document or one part of a
/// multipart stream. Every field is optional since intermediate parts may
/// carry any subset.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "cacheType")]
    pub cache_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "cacheKey")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attr: HashMap<String, HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<ResourceBlock>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub body: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foot: Option<ResourceBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub timing: HashMap<String, u64>,
}

/// Opaque handle to a DOM element created by a [`Dom`] implementation. The
/// library never inspects its contents; it is only ever passed back to the
/// same `Dom` to remove or mutate the element.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ElementHandle(pub String);

/// The DOM collaborator: the one seam between this crate's pure navigation
/// logic and an actual browser (or, in tests, an in-memory fake). Element
/// injection for scripts/styles is modeled as async because installing a
/// script element only resolves once the browser's `load` event fires.
#[async_trait::async_trait]
pub trait Dom: Send + Sync {
    /// Injects an `async` script tag, wiring its load handlers before `src`
    /// is set and inserting it before the head's first existing child, per
    /// the resource loader's element-injection contract. Resolves once the
    /// browser reports the script loaded (or its readystate reaches
    /// complete/loaded).
    async fn inject_script(&self, element_id: &str, url: &str) -> Result<ElementHandle, SpfError>;

    /// Injects a `rel=stylesheet` link, appended to head to preserve cascade
    /// order. Resolution is best-effort: browsers are inconsistent about
    /// firing `load` for stylesheets, so an implementation may resolve
    /// immediately after insertion when it cannot observe a real load event.
    async fn inject_style(&self, element_id: &str, url: &str) -> Result<ElementHandle, SpfError>;

    /// Fire-and-forget prefetch: primes the browser cache without installing
    /// a visible element.
    fn prefetch(&self, kind: ResourceKind, url: &str);

    /// Installs inline CSS text as a `<style>` element appended to head.
    fn inject_inline_style(&self, css: &str);

    /// Removes a previously injected element.
    fn remove(&self, handle: &ElementHandle);

    fn set_title(&self, title: &str);
    fn set_attr(&self, element_id: &str, attr: &str, value: &str);
    fn set_inner_html(&self, element_id: &str, html: &str);

    /// Lists elements already present in `<head>` bearing the framework's id
    /// prefix, used by `discover` to adopt server-rendered resources.
    fn discover(&self, kind: ResourceKind) -> Vec<(String, String)>;
}

/// The session-storage seam: cache entries and the navigate-limit counter
/// mirror themselves here on every mutation and read themselves back on
/// construction, the way the source mirrors into the browser's
/// `sessionStorage`. Keyed by an opaque namespace string so unrelated
/// collaborators (cache, session cap) don't collide under one key.
pub trait SnapshotStore: Send + Sync {
    fn read(&self, namespace: &str) -> Option<serde_json::Value>;
    fn write(&self, namespace: &str, value: serde_json::Value);
}

/// Milliseconds since the Unix epoch; the one clock source every crate shares.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory [`Dom`] fake for tests: resolves every injection immediately
/// and records what was injected/removed for assertions.
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub struct InMemoryDom {
        pub injected: Mutex<Vec<(ResourceKind, String, String)>>,
        pub removed: Mutex<Vec<String>>,
        pub title: Mutex<Option<String>>,
        counter: AtomicU64,
    }

    impl InMemoryDom {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl Dom for InMemoryDom {
        async fn inject_script(&self, element_id: &str, url: &str) -> Result<ElementHandle, SpfError> {
            self.injected
                .lock()
                .push((ResourceKind::Script, element_id.to_string(), url.to_string()));
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(ElementHandle(format!("{element_id}-{n}")))
        }

        async fn inject_style(&self, element_id: &str, url: &str) -> Result<ElementHandle, SpfError> {
            self.injected
                .lock()
                .push((ResourceKind::Style, element_id.to_string(), url.to_string()));
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(ElementHandle(format!("{element_id}-{n}")))
        }

        fn prefetch(&self, _kind: ResourceKind, _url: &str) {}

        fn inject_inline_style(&self, _css: &str) {}

        fn remove(&self, handle: &ElementHandle) {
            self.removed.lock().push(handle.0.clone());
        }

        fn set_title(&self, title: &str) {
            *self.title.lock() = Some(title.to_string());
        }

        fn set_attr(&self, _element_id: &str, _attr: &str, _value: &str) {}

        fn set_inner_html(&self, _element_id: &str, _html: &str) {}

        fn discover(&self, _kind: ResourceKind) -> Vec<(String, String)> {
            Vec::new()
        }
    }

    /// In-memory [`SnapshotStore`] fake: a plain map, gone once the process
    /// exits, standing in for a real `sessionStorage` in tests.
    #[derive(Default)]
    pub struct InMemorySnapshotStore {
        values: Mutex<HashMap<String, serde_json::Value>>,
    }

    impl InMemorySnapshotStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SnapshotStore for InMemorySnapshotStore {
        fn read(&self, namespace: &str) -> Option<serde_json::Value> {
            self.values.lock().get(namespace).cloned()
        }

        fn write(&self, namespace: &str, value: serde_json::Value) {
            self.values.lock().insert(namespace.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_kind_round_trips_through_display() {
        assert_eq!(NavigationKind::Navigate.as_str(), "navigate");
        assert_eq!(NavigationKind::Prefetch.to_string(), "prefetch");
        assert!(NavigationKind::Navigate.advances_history());
        assert!(!NavigationKind::Prefetch.advances_history());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(NavigationId::new(), NavigationId::new());
    }

    #[test]
    fn timing_stamps_monotonic_keys() {
        let mut timing = Timing::new();
        timing.stamp("fetchStart");
        assert!(timing.get("fetchStart").is_some());
        assert!(timing.get("missing").is_none());
    }

    #[test]
    fn error_carries_kind_and_hint() {
        let err = SpfError::timeout("request exceeded 8000ms").retriable(true);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.retriable);
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn fake_dom_records_injections() {
        use fake::InMemoryDom;
        let dom = InMemoryDom::new();
        let handle = dom.inject_script("spf-s-1", "a.js").await.unwrap();
        assert_eq!(dom.injected.lock().len(), 1);
        dom.remove(&handle);
        assert_eq!(dom.removed.lock().len(), 1);
    }

    #[test]
    fn snapshot_store_round_trips_by_namespace() {
        use fake::InMemorySnapshotStore;
        let store = InMemorySnapshotStore::new();
        assert!(store.read("cache").is_none());
        store.write("cache", serde_json::json!({"a": 1}));
        store.write("session-cap", serde_json::json!({"count": 3}));
        assert_eq!(store.read("cache"), Some(serde_json::json!({"a": 1})));
        assert_eq!(store.read("session-cap"), Some(serde_json::json!({"count": 3})));
    }
}
