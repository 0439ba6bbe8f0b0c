//! Observability sink for the navigation state machine, grounded on
//! `state-center`'s `StateCenter`/`InMemoryStateCenter`/`NoopStateCenter`
//! trio: a trait collaborators record into, an in-memory ring-buffer
//! implementation for tests and embedders that want to inspect recent
//! activity, and a no-op default for production builds that don't.

use std::collections::VecDeque;

use parking_lot::Mutex;

use spf_core_types::now_ms;

/// One recorded transition: a short label (`"request"`, `"promoted"`,
/// `"error"`, ...) plus the URL it concerns and when it happened.
#[derive(Clone, Debug)]
pub struct DiagnosticEvent {
    pub at_ms: u64,
    pub label: String,
    pub url: String,
}

impl DiagnosticEvent {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            at_ms: now_ms(),
            label: label.into(),
            url: url.into(),
        }
    }
}

/// The diagnostics seam: a place for the navigator to record events
/// without coupling it to any particular inspection mechanism.
pub trait NavigatorDiagnostics: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

/// Keeps the most recent `capacity` events, dropping the oldest once full.
pub struct InMemoryDiagnostics {
    capacity: usize,
    events: Mutex<VecDeque<DiagnosticEvent>>,
}

impl InMemoryDiagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl Default for InMemoryDiagnostics {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NavigatorDiagnostics for InMemoryDiagnostics {
    fn record(&self, event: DiagnosticEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Discards every event. The default for embedders that don't care.
pub struct NoopDiagnostics;

impl NavigatorDiagnostics for NoopDiagnostics {
    fn record(&self, _event: DiagnosticEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let sink = InMemoryDiagnostics::new(2);
        sink.record(DiagnosticEvent::new("request", "/a"));
        sink.record(DiagnosticEvent::new("request", "/b"));
        sink.record(DiagnosticEvent::new("request", "/c"));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].url, "/b");
        assert_eq!(events[1].url, "/c");
    }

    #[test]
    fn noop_sink_records_nothing_observable() {
        let sink = NoopDiagnostics;
        sink.record(DiagnosticEvent::new("request", "/a"));
        // Nothing to assert on; the point is that it doesn't panic or retain.
    }
}
