//! Dedicated-thread periodic task scheduler driving flush and any other
//! recurring background work.
//!
//! Grounded on `SimpleSpanProcessor`'s dedicated-worker-thread pattern
//! (`opentelemetry-sdk/src/trace/span_processor.rs`, which spawns via
//! `thread::Builder::new().name(...).spawn(...)` and drives a message
//! channel), generalized from a single exporter channel to a condvar-gated
//! priority queue of scheduled callbacks.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Eq, PartialEq)]
struct HeapEntry {
    fire_at: Instant,
    id: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest fire time.
        other.fire_at.cmp(&self.fire_at).then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TaskInfo {
    interval: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    cancelled: Arc<AtomicBool>,
}

struct SchedulerState {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<u64, TaskInfo>,
    running_task: Option<u64>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    cv: Condvar,
}

/// Handle returned by `schedule_recurring`. Dropping it does not cancel the
/// task; call [`CancelToken::cancel`] explicitly.
pub struct CancelToken {
    id: u64,
    cancelled: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Synchronously cancels the task. Blocks until any in-flight
    /// invocation of its callback returns.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
        let mut state = self.shared.state.lock().unwrap();
        state.tasks.remove(&self.id);
        while state.running_task == Some(self.id) {
            state = self.shared.cv.wait(state).unwrap();
        }
        self.shared.cv.notify_all();
    }
}

/// Single background worker thread driving all scheduled callbacks
/// serially (cooperative-within-thread), in parallel with whatever threads
/// are producing spans.
pub struct EventScheduler {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventScheduler").finish()
    }
}

impl EventScheduler {
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                running_task: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("dd-trace-scheduler".to_string())
            .spawn(move || run_worker(worker_shared))
            .expect("failed to spawn scheduler worker thread");

        Arc::new(EventScheduler {
            shared,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Schedules `callback` to run every `interval`, starting after one
    /// `interval` has elapsed. Returns a token that can cancel it.
    pub fn schedule_recurring<F>(&self, interval: Duration, callback: F) -> CancelToken
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let fire_at = Instant::now() + interval;

        {
            let mut state = self.shared.state.lock().unwrap();
            state.tasks.insert(
                id,
                TaskInfo {
                    interval,
                    callback: Arc::new(callback),
                    cancelled: Arc::clone(&cancelled),
                },
            );
            state.heap.push(HeapEntry { fire_at, id });
        }
        self.shared.cv.notify_all();

        CancelToken {
            id,
            cancelled,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drains the worker by joining it. Any task still queued simply never
    /// fires again.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let (id, callback) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                match state.heap.peek() {
                    None => {
                        state = shared.cv.wait(state).unwrap();
                    }
                    Some(entry) => {
                        let now = Instant::now();
                        if entry.fire_at <= now {
                            break;
                        }
                        let timeout = entry.fire_at - now;
                        let (s, _) = shared.cv.wait_timeout(state, timeout).unwrap();
                        state = s;
                    }
                }
            }

            let entry = state.heap.pop().expect("peeked entry must be poppable");
            let (interval, callback) = match state.tasks.get(&entry.id) {
                Some(task) if !task.cancelled.load(AtomicOrdering::SeqCst) => {
                    (task.interval, Arc::clone(&task.callback))
                }
                _ => continue,
            };
            let next_fire = Instant::now() + interval;
            state.heap.push(HeapEntry { fire_at: next_fire, id: entry.id });
            state.running_task = Some(entry.id);
            (entry.id, callback)
        };

        callback();

        {
            let mut state = shared.state.lock().unwrap();
            state.running_task = None;
        }
        shared.cv.notify_all();
        let _ = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn recurring_task_fires_more_than_once() {
        let scheduler = EventScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let token = scheduler.schedule_recurring(Duration::from_millis(5), move || {
            count_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(60));
        token.cancel();
        assert!(count.load(AtomicOrdering::SeqCst) >= 2);
    }

    #[test]
    fn cancel_stops_future_firings() {
        let scheduler = EventScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let token = scheduler.schedule_recurring(Duration::from_millis(5), move || {
            count_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        let after_cancel = count.load(AtomicOrdering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(AtomicOrdering::SeqCst), after_cancel);
    }

    #[test]
    fn shutdown_joins_the_worker_thread() {
        let scheduler = EventScheduler::new();
        scheduler.shutdown();
    }
}
