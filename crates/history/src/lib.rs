//! History binding: wraps the browser's push/replace-state primitives and
//! classifies pop events (the back/forward buttons) as back or forward by
//! comparing the timestamp stamped into every entry's state.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use spf_core_types::now_ms;

const TIMESTAMP_KEY: &str = "spf-timestamp";

/// The browser collaborator: pushing/replacing history entries and reporting
/// the currently displayed URL. A real implementation wraps the History API;
/// a fake records calls for assertions.
pub trait HistoryBackend: Send + Sync {
    fn push(&self, url: &str, state: Value);
    fn replace(&self, url: &str, state: Value);
}

/// Outcome of a pop event (back/forward button, or programmatic `history.go`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PopOutcome {
    /// No state on the popped entry: this is the initial page load, not a
    /// real transition. The caller should ignore it.
    InitialLoad,
    /// Same URL as currently tracked: state is re-applied but no navigation
    /// is triggered.
    Unchanged,
    Navigate { url: String, state: Value, back: bool },
}

struct Tracked {
    url: String,
    timestamp: u64,
}

/// Mediates all history mutation and pop classification for one page.
pub struct HistoryBinding {
    backend: Arc<dyn HistoryBackend>,
    tracked: Mutex<Tracked>,
}

impl HistoryBinding {
    /// Records the current URL as a replace-state entry, per initialization.
    pub fn new(backend: Arc<dyn HistoryBackend>, initial_url: impl Into<String>) -> Self {
        let url = initial_url.into();
        let timestamp = now_ms();
        backend.replace(&url, json!({ TIMESTAMP_KEY: timestamp }));
        Self {
            backend,
            tracked: Mutex::new(Tracked { url, timestamp }),
        }
    }

    /// Pushes a new entry. `do_callback = false` records the transition
    /// internally without touching the underlying History API — used when
    /// the URL already changed out-of-band (e.g. responding to a pop).
    pub fn add(&self, url: &str, mut state: Value, do_callback: bool) {
        let timestamp = now_ms();
        stamp(&mut state, timestamp);
        if do_callback {
            self.backend.push(url, state);
        }
        *self.tracked.lock() = Tracked {
            url: url.to_string(),
            timestamp,
        };
    }

    pub fn replace(&self, url: &str, mut state: Value, do_callback: bool) {
        let timestamp = now_ms();
        stamp(&mut state, timestamp);
        if do_callback {
            self.backend.replace(url, state);
        }
        *self.tracked.lock() = Tracked {
            url: url.to_string(),
            timestamp,
        };
    }

    /// Classifies an incoming pop event against the last tracked entry.
    pub fn handle_pop(&self, url: &str, state: Option<Value>) -> PopOutcome {
        let Some(state) = state else {
            debug!("pop event carried no state; treating as initial load");
            return PopOutcome::InitialLoad;
        };
        let incoming_timestamp = state
            .get(TIMESTAMP_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut tracked = self.tracked.lock();
        if url == tracked.url {
            tracked.timestamp = incoming_timestamp;
            return PopOutcome::Unchanged;
        }

        let back = incoming_timestamp < tracked.timestamp;
        tracked.url = url.to_string();
        tracked.timestamp = incoming_timestamp;
        PopOutcome::Navigate {
            url: url.to_string(),
            state,
            back,
        }
    }

    pub fn current_url(&self) -> String {
        self.tracked.lock().url.clone()
    }
}

fn stamp(state: &mut Value, timestamp: u64) {
    if !state.is_object() {
        *state = json!({});
    }
    state
        .as_object_mut()
        .expect("just normalized to object")
        .insert(TIMESTAMP_KEY.to_string(), json!(timestamp));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeBackend {
        pushed: Arc<PMutex<Vec<(String, Value)>>>,
        replaced: Arc<PMutex<Vec<(String, Value)>>>,
    }

    impl HistoryBackend for FakeBackend {
        fn push(&self, url: &str, state: Value) {
            self.pushed.lock().push((url.to_string(), state));
        }
        fn replace(&self, url: &str, state: Value) {
            self.replaced.lock().push((url.to_string(), state));
        }
    }

    #[test]
    fn initialization_replaces_current_url_with_timestamp() {
        let backend = FakeBackend::default();
        let replaced = backend.replaced.clone();
        let _binding = HistoryBinding::new(Arc::new(backend), "/a");
        assert_eq!(replaced.lock().len(), 1);
        assert_eq!(replaced.lock()[0].0, "/a");
    }

    #[test]
    fn pop_with_no_state_is_initial_load() {
        let binding = HistoryBinding::new(Arc::new(FakeBackend::default()), "/a");
        assert_eq!(binding.handle_pop("/a", None), PopOutcome::InitialLoad);
    }

    #[test]
    fn pop_to_same_url_is_unchanged() {
        let binding = HistoryBinding::new(Arc::new(FakeBackend::default()), "/a");
        let outcome = binding.handle_pop("/a", Some(json!({ TIMESTAMP_KEY: 1 })));
        assert_eq!(outcome, PopOutcome::Unchanged);
    }

    #[test]
    fn earlier_timestamp_classifies_as_back() {
        let binding = HistoryBinding::new(Arc::new(FakeBackend::default()), "/a");
        binding.add("/b", json!({}), true);
        let stored_timestamp = binding.tracked.lock().timestamp;
        let outcome = binding.handle_pop("/a", Some(json!({ TIMESTAMP_KEY: stored_timestamp.saturating_sub(100) })));
        match outcome {
            PopOutcome::Navigate { back, url, .. } => {
                assert!(back);
                assert_eq!(url, "/a");
            }
            other => panic!("expected Navigate, got {other:?}"),
        }
    }

    #[test]
    fn later_timestamp_classifies_as_forward() {
        let binding = HistoryBinding::new(Arc::new(FakeBackend::default()), "/a");
        binding.add("/b", json!({}), true);
        let stored_timestamp = binding.tracked.lock().timestamp;
        let outcome = binding.handle_pop("/c", Some(json!({ TIMESTAMP_KEY: stored_timestamp + 100 })));
        match outcome {
            PopOutcome::Navigate { back, .. } => assert!(!back),
            other => panic!("expected Navigate, got {other:?}"),
        }
    }
}
