//! Keyed FIFO task queues with a suspend/resume semaphore.
//!
//! Scripts must execute in document order even though loading one may stall
//! arbitrarily; the response applier suspends a queue while a script is
//! in flight and resumes it when that script finishes, so the next task in
//! the same queue does not run early. Grounded on the teacher's weighted lane
//! manager, simplified here to plain per-key FIFO since the spec has no
//! priority concept at this layer — ordering comes entirely from key + delay.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

/// A queued unit of work. Invoked at most once; panics inside it are caught
/// and swallowed so later tasks in the queue still run.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Item {
    task: Task,
    delay_ms: u64,
}

struct QueueState {
    items: VecDeque<Item>,
    /// > 0 means runnable. Starts at 1; `suspend`/`resume` step it down/up.
    semaphore: i64,
    /// True while a drain (inline or timer-scheduled) is in flight, so a
    /// concurrent non-sync `run` does not start a second drain chain.
    draining: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            semaphore: 1,
            draining: false,
        }
    }
}

/// Manager owning every named queue. Cheap to clone: internally `Arc`-backed.
#[derive(Clone, Default)]
pub struct TaskQueueManager {
    queues: Arc<DashMap<String, Arc<Mutex<QueueState>>>>,
}

impl TaskQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, key: &str) -> Arc<Mutex<QueueState>> {
        self.queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(QueueState::new())))
            .clone()
    }

    /// Pushes `task` onto `key`'s queue (creating it if missing) and returns
    /// the queue's new length. Does not itself trigger a drain — callers
    /// typically follow with `run`.
    pub fn add(&self, key: &str, task: Task, delay_ms: u64) -> usize {
        let state = self.queue(key);
        let mut guard = state.lock();
        guard.items.push_back(Item { task, delay_ms });
        guard.items.len()
    }

    /// Drains `key`'s queue if it exists, is not suspended, and is not
    /// already draining. With `sync = true`, drains inline (ignoring any
    /// pending per-item delay) even if a drain is already in flight.
    pub fn run(&self, key: &str, sync: bool) {
        let Some(state) = self.queues.get(key).map(|e| e.clone()) else {
            return;
        };
        if sync {
            Self::drain_sync(&state);
            return;
        }
        let mut guard = state.lock();
        if guard.semaphore <= 0 || guard.draining {
            return;
        }
        guard.draining = true;
        drop(guard);
        Self::schedule_step(state);
    }

    /// Decrements the semaphore, suspending the queue once it reaches 0 or below.
    pub fn suspend(&self, key: &str) {
        let state = self.queue(key);
        state.lock().semaphore -= 1;
    }

    /// Increments the semaphore and, if it becomes runnable again, re-triggers `run`.
    pub fn resume(&self, key: &str, sync: bool) {
        let state = self.queue(key);
        state.lock().semaphore += 1;
        self.run(key, sync);
    }

    /// Clears any pending drain state and removes the queue entirely; any
    /// items still queued are discarded without running.
    pub fn cancel(&self, key: &str) {
        self.queues.remove(key);
    }

    /// Cancels every queue whose key starts with `prefix`, except `skip_key`.
    pub fn cancel_all_except(&self, prefix: &str, skip_key: &str) {
        let victims: Vec<String> = self
            .queues
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix) && k != skip_key)
            .collect();
        for key in victims {
            self.queues.remove(&key);
        }
    }

    pub fn len(&self, key: &str) -> usize {
        self.queues.get(key).map(|e| e.lock().items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    /// Inline drain used by `run(key, sync = true)`: ignores delays and the
    /// `draining` flag, but still respects suspension.
    fn drain_sync(state: &Arc<Mutex<QueueState>>) {
        loop {
            let item = {
                let mut guard = state.lock();
                if guard.semaphore <= 0 {
                    return;
                }
                guard.items.pop_front()
            };
            match item {
                Some(item) => run_task(item.task),
                None => return,
            }
        }
    }

    /// Schedules the "invoke head, then re-drain" pair at the head's delay,
    /// spawned on the ambient tokio runtime. Recurses by re-scheduling itself
    /// until the queue is empty, suspended, or cancelled out from under it.
    fn schedule_step(state: Arc<Mutex<QueueState>>) {
        let item = {
            let mut guard = state.lock();
            if guard.semaphore <= 0 {
                guard.draining = false;
                return;
            }
            match guard.items.pop_front() {
                Some(item) => item,
                None => {
                    guard.draining = false;
                    return;
                }
            }
        };
        tokio::spawn(async move {
            if item.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(item.delay_ms)).await;
            } else {
                tokio::task::yield_now().await;
            }
            run_task(item.task);
            let mut guard = state.lock();
            if guard.semaphore <= 0 {
                guard.draining = false;
                return;
            }
            if guard.items.is_empty() {
                guard.draining = false;
                return;
            }
            drop(guard);
            TaskQueueManager::schedule_step(state);
        });
    }
}

fn run_task(task: Task) {
    if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!("task queue item panicked; continuing with remaining tasks");
    }
}
