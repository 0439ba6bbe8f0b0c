//! Bounded, TTL-aware cache of navigation responses.
//!
//! Grounded on the teacher's bounded-ring eviction idiom (`state-center`'s
//! `BoundedRing<T>`), adapted from a pure ring to a keyed map since entries
//! are looked up by URL rather than drained in order, but keeping the same
//! "insertion order governs eviction" discipline.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use spf_core_types::{now_ms, CacheKind, Response, SnapshotStore};

/// `lifetime <= 0` on `set` means infinite; `None` falls back to the cache's
/// configured default lifetime.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum Lifetime {
    Default,
    Infinite,
    Millis(u64),
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: Response,
    pub timestamp: u64,
    pub lifetime: Lifetime,
    pub kind: CacheKind,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        match self.lifetime {
            Lifetime::Infinite => false,
            Lifetime::Default => false,
            Lifetime::Millis(ms) => now.saturating_sub(self.timestamp) >= ms,
        }
    }
}

pub struct CacheConfig {
    pub lifetime_ms: u64,
    pub max_entries: usize,
    pub unified: bool,
    /// Mirrors every mutation into the snapshot store and restores from it
    /// on construction, the way `sessionStorage` keeps a cache warm across
    /// page loads.
    pub session_storage: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lifetime_ms: 600_000,
            max_entries: 50,
            unified: false,
            session_storage: false,
        }
    }
}

struct Inner {
    entries: std::collections::HashMap<String, CacheEntry>,
    /// Insertion order, oldest first, for FIFO eviction once over `max_entries`.
    order: VecDeque<String>,
}

const SNAPSHOT_NAMESPACE: &str = "spf:cache";

fn mirror(store: &Arc<dyn SnapshotStore>, inner: &Inner) {
    let ordered: Vec<&CacheEntry> = inner.order.iter().filter_map(|key| inner.entries.get(key)).collect();
    if let Ok(value) = serde_json::to_value(&ordered) {
        store.write(SNAPSHOT_NAMESPACE, value);
    }
}

/// Bounded response cache keyed by URL (or explicit `cacheKey`).
pub struct ResponseCache {
    config: CacheConfig,
    inner: RwLock<Inner>,
    snapshot: Option<Arc<dyn SnapshotStore>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_snapshot_store(config, None)
    }

    /// Like `new`, but when `config.session_storage` is set, restores
    /// entries already mirrored under [`SNAPSHOT_NAMESPACE`] and keeps
    /// `snapshot` in sync with every later mutation.
    pub fn with_snapshot_store(config: CacheConfig, snapshot: Option<Arc<dyn SnapshotStore>>) -> Self {
        let mut inner = Inner {
            entries: std::collections::HashMap::new(),
            order: VecDeque::new(),
        };
        if config.session_storage {
            if let Some(store) = &snapshot {
                if let Some(value) = store.read(SNAPSHOT_NAMESPACE) {
                    if let Ok(restored) = serde_json::from_value::<Vec<CacheEntry>>(value) {
                        for entry in restored {
                            inner.order.push_back(entry.key.clone());
                            inner.entries.insert(entry.key.clone(), entry);
                        }
                    }
                }
            }
        }
        Self {
            config,
            inner: RwLock::new(inner),
            snapshot,
        }
    }

    fn mirror_if_enabled(&self, inner: &Inner) {
        if self.config.session_storage {
            if let Some(store) = &self.snapshot {
                mirror(store, inner);
            }
        }
    }

    /// Looks up `key`. If `cache-unified` is false, `kind` (when given) must
    /// match the stored entry's kind or the lookup misses. Expired entries
    /// are evicted on read.
    pub fn get(&self, key: &str, kind: Option<CacheKind>) -> Option<Response> {
        let now = now_ms();
        {
            let guard = self.inner.read();
            let entry = guard.entries.get(key)?;
            if entry.is_expired(now) {
                drop(guard);
                self.remove(key);
                return None;
            }
            if !self.config.unified {
                if let Some(requested) = kind {
                    if !kinds_match(requested, entry.kind) {
                        return None;
                    }
                }
            }
            return Some(entry.response.clone());
        }
    }

    /// Inserts `response` under `key` with the given kind and lifetime. A
    /// `lifetime` of `Millis(0)` is a no-op (per spec: "zero lifetime means
    /// do not insert"). Evicts oldest-first once over `cache-max`.
    pub fn set(&self, key: &str, response: Response, kind: CacheKind, lifetime: Lifetime) {
        if let Lifetime::Millis(0) = lifetime {
            return;
        }
        let resolved = match lifetime {
            Lifetime::Default => Lifetime::Millis(self.config.lifetime_ms),
            other => other,
        };
        let mut guard = self.inner.write();
        let key_owned = key.to_string();
        if guard.entries.remove(&key_owned).is_some() {
            guard.order.retain(|k| k != &key_owned);
        }
        guard.entries.insert(
            key_owned.clone(),
            CacheEntry {
                key: key_owned.clone(),
                response,
                timestamp: now_ms(),
                lifetime: resolved,
                kind,
            },
        );
        guard.order.push_back(key_owned);
        while guard.order.len() > self.config.max_entries {
            if let Some(oldest) = guard.order.pop_front() {
                guard.entries.remove(&oldest);
            }
        }
        self.mirror_if_enabled(&guard);
    }

    pub fn remove(&self, key: &str) {
        let mut guard = self.inner.write();
        if guard.entries.remove(key).is_some() {
            guard.order.retain(|k| k != key);
        }
        self.mirror_if_enabled(&guard);
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut guard = self.inner.write();
        guard.entries.clear();
        guard.order.clear();
        self.mirror_if_enabled(&guard);
    }
}

fn kinds_match(requested: CacheKind, stored: CacheKind) -> bool {
    matches!(
        (requested, stored),
        (CacheKind::Navigate, CacheKind::Navigate) | (CacheKind::Prefetch, CacheKind::Prefetch)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> Response {
        Response {
            title: Some("T".into()),
            ..Default::default()
        }
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = ResponseCache::new(CacheConfig::default());
        assert!(cache.get("/missing", None).is_none());
    }

    #[test]
    fn hit_then_expires_after_lifetime() {
        let cache = ResponseCache::new(CacheConfig::default());
        cache.set("/a", response(), CacheKind::Navigate, Lifetime::Millis(0));
        // lifetime 0 means "do not insert" per spec, so this should miss.
        assert!(cache.get("/a", None).is_none());

        cache.set("/b", response(), CacheKind::Navigate, Lifetime::Infinite);
        assert!(cache.get("/b", None).is_some());
    }

    #[test]
    fn eviction_is_oldest_first_at_capacity() {
        let cache = ResponseCache::new(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        cache.set("A", response(), CacheKind::Navigate, Lifetime::Infinite);
        cache.set("B", response(), CacheKind::Navigate, Lifetime::Infinite);
        cache.set("C", response(), CacheKind::Navigate, Lifetime::Infinite);
        assert!(cache.get("A", None).is_none());
        assert!(cache.get("B", None).is_some());
        assert!(cache.get("C", None).is_some());
    }

    #[test]
    fn unified_false_requires_matching_kind() {
        let cache = ResponseCache::new(CacheConfig {
            unified: false,
            ..CacheConfig::default()
        });
        cache.set("/x", response(), CacheKind::Prefetch, Lifetime::Infinite);
        assert!(cache.get("/x", Some(CacheKind::Navigate)).is_none());
        assert!(cache.get("/x", Some(CacheKind::Prefetch)).is_some());
    }

    #[test]
    fn unified_true_ignores_kind_mismatch() {
        let cache = ResponseCache::new(CacheConfig {
            unified: true,
            ..CacheConfig::default()
        });
        cache.set("/x", response(), CacheKind::Prefetch, Lifetime::Infinite);
        assert!(cache.get("/x", Some(CacheKind::Navigate)).is_some());
    }

    #[test]
    fn session_storage_mirrors_and_restores_across_instances() {
        use spf_core_types::fake::InMemorySnapshotStore;
        let store: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
        let config = CacheConfig {
            session_storage: true,
            ..CacheConfig::default()
        };
        let first = ResponseCache::with_snapshot_store(config, Some(store.clone()));
        first.set("/a", response(), CacheKind::Navigate, Lifetime::Infinite);

        let config = CacheConfig {
            session_storage: true,
            ..CacheConfig::default()
        };
        let restored = ResponseCache::with_snapshot_store(config, Some(store));
        let entry = restored.get("/a", Some(CacheKind::Navigate));
        assert_eq!(entry.and_then(|r| r.title), Some("T".to_string()));
    }

    #[test]
    fn session_storage_disabled_does_not_touch_the_store() {
        use spf_core_types::fake::InMemorySnapshotStore;
        let store: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
        let cache = ResponseCache::with_snapshot_store(CacheConfig::default(), Some(store.clone()));
        cache.set("/a", response(), CacheKind::Navigate, Lifetime::Infinite);
        assert!(store.read(SNAPSHOT_NAMESPACE).is_none());
    }
}
