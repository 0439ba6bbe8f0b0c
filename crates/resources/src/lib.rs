//! Script/style resource loader.
//!
//! Scripts and styles share everything except element construction, so both
//! are modeled through the single [`Dom`] seam keyed by [`ResourceKind`]
//! (per the "polymorphic resource loader" design note): one registry of
//! records, one id scheme, one name-aliasing table.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use spf_core_types::{Dom, ElementHandle, ResourceKind, SpfError};

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    Loading,
    Loaded,
    Error,
}

struct Record {
    url: String,
    name: Option<String>,
    status: Status,
    handle: Option<ElementHandle>,
    waiters: Vec<oneshot::Sender<Result<(), SpfError>>>,
}

/// URL rewriting applied before hashing, set via `path`. Order of rule
/// application for a map is unspecified, per the contract; callers must keep
/// rules disjoint.
#[derive(Clone, Debug, Default)]
pub struct PathRules {
    pub prefix: Option<String>,
    pub replacements: HashMap<String, String>,
}

impl PathRules {
    fn apply(&self, url: &str) -> String {
        let mut rewritten = url.to_string();
        for (from, to) in &self.replacements {
            rewritten = rewritten.replace(from.as_str(), to.as_str());
        }
        if let Some(prefix) = &self.prefix {
            if !rewritten.starts_with(prefix.as_str()) {
                rewritten = format!("{prefix}{rewritten}");
            }
        }
        rewritten
    }
}

fn resource_id(kind: ResourceKind, url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    format!("spf-{}-{:x}", kind.as_str(), hasher.finish())
}

/// Owns every script/style record and mediates all DOM injection through a
/// shared [`Dom`] implementation.
pub struct ResourceLoader {
    dom: Arc<dyn Dom>,
    records: DashMap<String, Mutex<Record>>,
    /// `(kind, name) -> ids currently associated with that name`, newest last.
    names: DashMap<(ResourceKind, String), Vec<String>>,
    paths: DashMap<ResourceKind, PathRules>,
}

impl ResourceLoader {
    pub fn new(dom: Arc<dyn Dom>) -> Self {
        Self {
            dom,
            records: DashMap::new(),
            names: DashMap::new(),
            paths: DashMap::new(),
        }
    }

    /// Installs rewrite rules applied to every subsequent URL of `kind`
    /// before it is hashed into a record id.
    pub fn path(&self, kind: ResourceKind, rules: PathRules) {
        self.paths.insert(kind, rules);
    }

    fn rewrite(&self, kind: ResourceKind, url: &str) -> String {
        self.paths
            .get(&kind)
            .map(|rules| rules.apply(url))
            .unwrap_or_else(|| url.to_string())
    }

    /// Loads `urls` of `kind` in order, installing each exactly once even if
    /// already loading, and fires `callback` once after every URL resolves
    /// (successfully or not — a single resource erroring does not stop the
    /// ones already resolved, it only marks its own record `Error`).
    pub async fn load(
        &self,
        kind: ResourceKind,
        urls: &[String],
        name: Option<String>,
        callback: Option<Callback>,
    ) {
        let mut last_id = None;
        for url in urls {
            let rewritten = self.rewrite(kind, url);
            let id = resource_id(kind, &rewritten);
            if let Err(err) = self.load_one(kind, &id, &rewritten).await {
                warn!(url = %rewritten, error = %err, "resource failed to load");
            }
            last_id = Some(id);
        }

        if let (Some(name), Some(last_id)) = (name.clone(), last_id.clone()) {
            self.adopt_name(kind, &name, &last_id);
        }

        if let Some(cb) = callback {
            cb();
        }
    }

    /// Resolves once the record for `id` is loaded, creating and injecting
    /// it if this is the first request, or subscribing to the in-flight
    /// injection if another caller already started it.
    async fn load_one(&self, kind: ResourceKind, id: &str, url: &str) -> Result<(), SpfError> {
        let rx = {
            use dashmap::mapref::entry::Entry;
            match self.records.entry(id.to_string()) {
                Entry::Vacant(slot) => {
                    // First caller for this id: creates the record and performs the
                    // injection itself below, nothing to wait on.
                    slot.insert(Mutex::new(Record {
                        url: url.to_string(),
                        name: None,
                        status: Status::Loading,
                        handle: None,
                        waiters: Vec::new(),
                    }));
                    None
                }
                Entry::Occupied(slot) => {
                    let mut record = slot.get().lock();
                    match record.status {
                        Status::Loaded => return Ok(()),
                        Status::Error => {
                            // Retry is out of scope here; report the prior failure.
                            return Err(SpfError::apply(format!("{url} previously failed to load")));
                        }
                        Status::Loading => {
                            // Already in flight (this call did not create it): subscribe.
                            let (tx, rx) = oneshot::channel();
                            record.waiters.push(tx);
                            Some(rx)
                        }
                    }
                }
            }
        };

        if let Some(rx) = rx {
            return rx.await.unwrap_or_else(|_| Err(SpfError::apply("loader dropped")));
        }

        // First caller for this id: perform the injection.
        let result = match kind {
            ResourceKind::Script => self.dom.inject_script(id, url).await,
            ResourceKind::Style => self.dom.inject_style(id, url).await,
        };

        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.clone());
        if let Some(entry) = self.records.get(id) {
            let mut record = entry.lock();
            record.status = if outcome.is_ok() { Status::Loaded } else { Status::Error };
            if let Ok(handle) = &result {
                record.handle = Some(handle.clone());
            }
            for waiter in record.waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }
        outcome
    }

    /// Associates `id` with `name`, unloading every other URL previously
    /// under that name once `id` itself is loaded (the newest wins).
    fn adopt_name(&self, kind: ResourceKind, name: &str, id: &str) {
        if let Some(entry) = self.records.get(id) {
            entry.lock().name = Some(name.to_string());
        }
        let previous = {
            let mut bucket = self.names.entry((kind, name.to_string())).or_default();
            let previous: Vec<String> = bucket.iter().filter(|existing| *existing != id).cloned().collect();
            bucket.push(id.to_string());
            previous
        };
        for old_id in previous {
            self.remove_record(&old_id);
        }
    }

    /// Removes every URL currently associated with `name`: their DOM
    /// elements, records, and the name mapping itself. Pending callbacks on
    /// other records are untouched.
    pub fn unload(&self, kind: ResourceKind, name: &str) {
        if let Some((_, ids)) = self.names.remove(&(kind, name.to_string())) {
            for id in ids {
                self.remove_record(&id);
            }
        }
    }

    fn remove_record(&self, id: &str) {
        if let Some((_, record)) = self.records.remove(id) {
            let record = record.into_inner();
            if let Some(handle) = record.handle {
                self.dom.remove(&handle);
            }
        }
    }

    /// Non-blocking fetch that primes the browser cache without marking the
    /// resource loaded; a later `load` of the same URL still installs it.
    pub fn prefetch(&self, kind: ResourceKind, url: &str) {
        let rewritten = self.rewrite(kind, url);
        self.dom.prefetch(kind, &rewritten);
    }

    /// Registers elements already present in `<head>` (server-rendered first
    /// paint) as loaded records, so a later `load` of the same URL is a hit.
    pub fn discover(&self, kind: ResourceKind) {
        for (element_id, url) in self.dom.discover(kind) {
            self.records.entry(element_id).or_insert_with(|| {
                Mutex::new(Record {
                    url,
                    name: None,
                    status: Status::Loaded,
                    handle: None,
                    waiters: Vec::new(),
                })
            });
        }
    }

    /// Unconditional injection bypassing the registry entirely; the caller
    /// owns the resulting handle and it is never touched by `unload`.
    pub async fn create(&self, kind: ResourceKind, url: &str) -> Result<ElementHandle, SpfError> {
        let rewritten = self.rewrite(kind, url);
        let id = format!("spf-create-{}", resource_id(kind, &rewritten));
        match kind {
            ResourceKind::Script => self.dom.inject_script(&id, &rewritten).await,
            ResourceKind::Style => self.dom.inject_style(&id, &rewritten).await,
        }
    }

    pub fn is_loaded(&self, kind: ResourceKind, url: &str) -> bool {
        let rewritten = self.rewrite(kind, url);
        let id = resource_id(kind, &rewritten);
        self.records
            .get(&id)
            .map(|e| e.lock().status == Status::Loaded)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spf_core_types::fake::InMemoryDom;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loads_urls_in_order_and_fires_callback_once() {
        let dom = Arc::new(InMemoryDom::new());
        let loader = ResourceLoader::new(dom.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        loader
            .load(
                ResourceKind::Script,
                &["a.js".into(), "b.js".into(), "c.js".into()],
                None,
                Some(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let injected = dom.injected.lock();
        let urls: Vec<&str> = injected.iter().map(|(_, _, url)| url.as_str()).collect();
        assert_eq!(urls, vec!["a.js", "b.js", "c.js"]);
    }

    #[tokio::test]
    async fn duplicate_load_of_already_loaded_url_does_not_reinject() {
        let dom = Arc::new(InMemoryDom::new());
        let loader = ResourceLoader::new(dom.clone());
        loader.load(ResourceKind::Script, &["a.js".into()], None, None).await;
        loader.load(ResourceKind::Script, &["a.js".into()], None, None).await;
        assert_eq!(dom.injected.lock().len(), 1);
        assert!(loader.is_loaded(ResourceKind::Script, "a.js"));
    }

    #[tokio::test]
    async fn naming_unloads_prior_urls_under_the_same_name() {
        let dom = Arc::new(InMemoryDom::new());
        let loader = ResourceLoader::new(dom.clone());
        loader
            .load(ResourceKind::Script, &["main.v1.js".into()], Some("main".into()), None)
            .await;
        loader
            .load(ResourceKind::Script, &["main.v2.js".into()], Some("main".into()), None)
            .await;
        assert!(!loader.is_loaded(ResourceKind::Script, "main.v1.js"));
        assert!(loader.is_loaded(ResourceKind::Script, "main.v2.js"));
        assert_eq!(dom.removed.lock().len(), 1);
    }

    #[tokio::test]
    async fn path_rules_rewrite_before_hashing() {
        let dom = Arc::new(InMemoryDom::new());
        let loader = ResourceLoader::new(dom.clone());
        loader.path(
            ResourceKind::Script,
            PathRules {
                prefix: Some("/static/".into()),
                replacements: HashMap::new(),
            },
        );
        loader.load(ResourceKind::Script, &["a.js".into()], None, None).await;
        let injected = dom.injected.lock();
        assert_eq!(injected[0].2, "/static/a.js");
    }
}
