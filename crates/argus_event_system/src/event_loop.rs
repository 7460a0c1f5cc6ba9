//! Thread-backed work loop with delayed and periodic scheduling.
//!
//! Each [`EventLoop`] owns at most one executor thread and a min-heap
//! of scheduled entries ordered by target time, with a monotonic
//! sequence as the FIFO tie-break for entries due at the same instant.
//! Entries are either handler/event dispatches or plain closures.
//! Periodic entries are reinserted at `target + interval` *before*
//! their work runs, so long handlers do not stretch the period.
//!
//! Submission is cheap and non-blocking; executing work never holds
//! the scheduling lock, so handlers may freely submit more work into
//! their own loop. A panicking handler is caught and logged and the
//! loop keeps running.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver};
use tracing::{debug, error, trace, warn};

use crate::event::{Event, EventHandler};

/// Work attached to one scheduled entry.
enum LoopWork {
    /// Dispatch `event` to `handler`. The event lives behind a mutex so
    /// periodic entries mutate one shared instance across firings.
    Dispatch {
        handler: Arc<dyn EventHandler>,
        event: Arc<Mutex<Event>>,
    },
    Once(Box<dyn FnOnce() + Send>),
    Repeated(Arc<dyn Fn() + Send + Sync>),
}

impl LoopWork {
    /// Clone for periodic reinsertion. One-shot closures cannot repeat.
    fn clone_repeatable(&self) -> Option<LoopWork> {
        match self {
            LoopWork::Dispatch { handler, event } => Some(LoopWork::Dispatch {
                handler: handler.clone(),
                event: event.clone(),
            }),
            LoopWork::Repeated(task) => Some(LoopWork::Repeated(task.clone())),
            LoopWork::Once(_) => None,
        }
    }
}

struct ScheduledItem {
    seq: u64,
    target: Instant,
    period: Option<Duration>,
    work: LoopWork,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest target
// (then the lowest sequence) pops first.
impl Ord for ScheduledItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .target
            .cmp(&self.target)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.target == other.target
    }
}

impl Eq for ScheduledItem {}

struct LoopState {
    heap: BinaryHeap<ScheduledItem>,
    quit: bool,
}

/// Completion handle for [`EventLoop::add_event_for_result`].
///
/// Resolves to the handler's `on_event` return value, or `false` when
/// the dispatch never ran (missing handler/event, loop stopped before
/// execution, or the handler panicked).
pub struct EventResult {
    state: ResultState,
}

enum ResultState {
    Ready(bool),
    Pending(Receiver<bool>),
}

impl EventResult {
    fn ready(value: bool) -> Self {
        EventResult { state: ResultState::Ready(value) }
    }

    fn pending(receiver: Receiver<bool>) -> Self {
        EventResult { state: ResultState::Pending(receiver) }
    }

    /// Blocks until the dispatch completes.
    pub fn wait(self) -> bool {
        match self.state {
            ResultState::Ready(value) => value,
            ResultState::Pending(receiver) => receiver.recv().unwrap_or(false),
        }
    }

    /// Blocks up to `timeout`; `None` when the dispatch has not
    /// completed in time.
    pub fn wait_timeout(self, timeout: Duration) -> Option<bool> {
        match self.state {
            ResultState::Ready(value) => Some(value),
            ResultState::Pending(receiver) => receiver.recv_timeout(timeout).ok(),
        }
    }
}

/// A named scheduling loop bound to one executor thread.
pub struct EventLoop {
    name: String,
    state: Mutex<LoopState>,
    wake: Condvar,
    running: AtomicBool,
    next_seq: AtomicU64,
    current_seq: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    loop_thread: Mutex<Option<ThreadId>>,
    #[cfg(unix)]
    poller: Mutex<Option<crate::poller::FdPoller>>,
}

impl EventLoop {
    pub fn new(name: impl Into<String>) -> Self {
        EventLoop {
            name: name.into(),
            state: Mutex::new(LoopState { heap: BinaryHeap::new(), quit: false }),
            wake: Condvar::new(),
            running: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            current_seq: AtomicU64::new(0),
            thread: Mutex::new(None),
            loop_thread: Mutex::new(None),
            #[cfg(unix)]
            poller: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the caller is on this loop's executor thread. Blocking
    /// on a result from inside the same loop would deadlock; callers
    /// use this to dispatch inline instead.
    pub fn is_loop_thread(&self) -> bool {
        let current = thread::current().id();
        *self.lock_thread_id() == Some(current) && self.is_running()
    }

    /// Entries waiting in the schedule (periodic entries count once).
    pub fn pending_count(&self) -> usize {
        self.lock_state().heap.len()
    }

    /// Sequence of the entry executing right now, if any.
    pub fn current_sequence(&self) -> Option<u64> {
        match self.current_seq.load(Ordering::SeqCst) {
            0 => None,
            seq => Some(seq),
        }
    }

    /// Spawns the executor thread. A second call while running is a
    /// no-op; after [`EventLoop::stop`] the loop can start again.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lock_state().quit = false;
        let me = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("loop-{}", self.name))
            .spawn(move || me.run());
        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                debug!(name = %self.name, "event loop started");
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                error!(name = %self.name, error = %err, "failed to spawn loop thread");
            }
        }
    }

    /// Runs the loop on the calling thread, blocking until stopped.
    pub fn run_on_caller(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lock_state().quit = false;
        self.run();
    }

    /// Signals the loop to quit, drops whatever is still scheduled and
    /// joins the executor thread. Safe to call from inside a handler:
    /// the loop then exits once the handler returns, without
    /// self-joining. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.lock_state();
            if state.quit && !self.is_running() {
                return;
            }
            state.quit = true;
            state.heap.clear();
        }
        self.wake.notify_all();

        let on_loop_thread = *self.lock_thread_id() == Some(thread::current().id());
        if !on_loop_thread {
            let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            self.running.store(false, Ordering::SeqCst);
        }

        #[cfg(unix)]
        {
            let poller = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(poller) = poller {
                poller.shutdown();
            }
        }
        debug!(name = %self.name, "event loop stopped");
    }

    /// Schedules `event` for immediate dispatch to `handler` and
    /// returns the entry's sequence. If either argument is `None`
    /// nothing is scheduled; the fresh sequence is still returned.
    pub fn add_event(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        event: Option<Event>,
    ) -> u64 {
        let seq = self.alloc_seq();
        let (Some(handler), Some(event)) = (handler, event) else {
            trace!(name = %self.name, seq, "nothing to schedule");
            return seq;
        };
        self.schedule(ScheduledItem {
            seq,
            target: Instant::now(),
            period: None,
            work: LoopWork::Dispatch { handler, event: Arc::new(Mutex::new(event)) },
        });
        seq
    }

    /// Schedules a one-shot closure for immediate execution.
    pub fn add_task(&self, task: impl FnOnce() + Send + 'static) -> u64 {
        let seq = self.alloc_seq();
        self.schedule(ScheduledItem {
            seq,
            target: Instant::now(),
            period: None,
            work: LoopWork::Once(Box::new(task)),
        });
        seq
    }

    /// Schedules a dispatch whose boolean outcome can be awaited.
    pub fn add_event_for_result(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        event: Option<Event>,
    ) -> EventResult {
        let (Some(handler), Some(event)) = (handler, event) else {
            return EventResult::ready(false);
        };
        let (sender, receiver) = bounded::<bool>(1);
        let seq = self.alloc_seq();
        self.schedule(ScheduledItem {
            seq,
            target: Instant::now(),
            period: None,
            work: LoopWork::Once(Box::new(move || {
                let mut event = event;
                let accepted = handler.on_event(&mut event);
                let _ = sender.send(accepted);
            })),
        });
        EventResult::pending(receiver)
    }

    /// Schedules a delayed handler/event dispatch, repeating every
    /// `interval` when `repeat` is set. The sequence stays stable
    /// across firings, so one [`EventLoop::remove_event`] cancels the
    /// series.
    pub fn add_timer_event(
        &self,
        handler: Option<Arc<dyn EventHandler>>,
        event: Option<Event>,
        interval: Duration,
        repeat: bool,
    ) -> u64 {
        let seq = self.alloc_seq();
        let (Some(handler), Some(event)) = (handler, event) else {
            trace!(name = %self.name, seq, "nothing to schedule");
            return seq;
        };
        self.schedule(ScheduledItem {
            seq,
            target: Instant::now() + interval,
            period: repeat.then_some(interval),
            work: LoopWork::Dispatch { handler, event: Arc::new(Mutex::new(event)) },
        });
        seq
    }

    /// Closure flavor of [`EventLoop::add_timer_event`].
    pub fn add_timer_task(
        &self,
        task: impl Fn() + Send + Sync + 'static,
        interval: Duration,
        repeat: bool,
    ) -> u64 {
        let seq = self.alloc_seq();
        self.schedule(ScheduledItem {
            seq,
            target: Instant::now() + interval,
            period: repeat.then_some(interval),
            work: LoopWork::Repeated(Arc::new(task)),
        });
        seq
    }

    /// Cancels the entry with the given sequence. Returns whether an
    /// entry was actually removed; an entry already executing is not
    /// interrupted, but a periodic entry stops recurring.
    pub fn remove_event(&self, seq: u64) -> bool {
        let removed = {
            let mut state = self.lock_state();
            let before = state.heap.len();
            let kept: BinaryHeap<ScheduledItem> =
                state.heap.drain().filter(|item| item.seq != seq).collect();
            state.heap = kept;
            state.heap.len() != before
        };
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    /// Registers a file descriptor watcher serviced by this loop. The
    /// callback runs as loop work whenever the descriptor is ready;
    /// readiness is re-armed after the callback returns. Returns
    /// `false` when the watcher table is full or the name is taken.
    #[cfg(unix)]
    pub fn add_fd_event_callback(
        self: &Arc<Self>,
        name: &str,
        callback: Arc<dyn crate::poller::FileDescriptorEventCallback>,
    ) -> bool {
        let mut slot = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            match crate::poller::FdPoller::spawn(Arc::downgrade(self), self.name.clone()) {
                Ok(poller) => *slot = Some(poller),
                Err(err) => {
                    warn!(name = %self.name, error = %err, "could not start fd poller");
                    return false;
                }
            }
        }
        slot.as_ref().map(|p| p.watch(name, callback)).unwrap_or(false)
    }

    #[cfg(not(unix))]
    pub fn add_fd_event_callback(
        self: &Arc<Self>,
        _name: &str,
        _callback: Arc<dyn crate::poller::FileDescriptorEventCallback>,
    ) -> bool {
        false
    }

    /// Unregisters a named descriptor watcher.
    #[cfg(unix)]
    pub fn remove_fd_event_callback(&self, name: &str) -> bool {
        let slot = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|p| p.unwatch(name)).unwrap_or(false)
    }

    #[cfg(not(unix))]
    pub fn remove_fd_event_callback(&self, _name: &str) -> bool {
        false
    }

    fn alloc_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn schedule(&self, item: ScheduledItem) {
        {
            let mut state = self.lock_state();
            state.heap.push(item);
        }
        self.wake.notify_one();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_thread_id(&self) -> std::sync::MutexGuard<'_, Option<ThreadId>> {
        self.loop_thread.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(self: &Arc<Self>) {
        *self.lock_thread_id() = Some(thread::current().id());
        trace!(name = %self.name, "loop thread entered");
        'outer: loop {
            let mut due: Vec<ScheduledItem> = Vec::new();
            {
                let mut state = self.lock_state();
                loop {
                    if state.quit {
                        state.heap.clear();
                        break 'outer;
                    }
                    let now = Instant::now();
                    while state.heap.peek().is_some_and(|item| item.target <= now) {
                        if let Some(item) = state.heap.pop() {
                            if let Some(period) = item.period {
                                if let Some(work) = item.work.clone_repeatable() {
                                    state.heap.push(ScheduledItem {
                                        seq: item.seq,
                                        target: item.target + period,
                                        period: item.period,
                                        work,
                                    });
                                }
                            }
                            due.push(item);
                        }
                    }
                    if !due.is_empty() {
                        break;
                    }
                    state = match state.heap.peek().map(|item| item.target) {
                        Some(target) => {
                            let wait = target.saturating_duration_since(Instant::now());
                            self.wake
                                .wait_timeout(state, wait)
                                .map(|(guard, _)| guard)
                                .unwrap_or_else(|e| e.into_inner().0)
                        }
                        None => self
                            .wake
                            .wait(state)
                            .unwrap_or_else(|e| e.into_inner()),
                    };
                }
            }
            for item in due {
                self.execute(item);
                if self.lock_state().quit {
                    continue 'outer;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        trace!(name = %self.name, "loop thread exited");
    }

    fn execute(&self, item: ScheduledItem) {
        let seq = item.seq;
        self.current_seq.store(seq, Ordering::SeqCst);
        let outcome = catch_unwind(AssertUnwindSafe(|| match item.work {
            LoopWork::Dispatch { handler, event } => {
                let mut event = event.lock().unwrap_or_else(|e| e.into_inner());
                handler.on_event(&mut event);
            }
            LoopWork::Once(task) => task(),
            LoopWork::Repeated(task) => task(),
        }));
        if outcome.is_err() {
            error!(name = %self.name, seq, "scheduled work panicked; loop continues");
        }
        self.current_seq.store(0, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // By the time an EventLoop drops no Arc remains, so the
        // executor thread (which holds one) is already gone unless the
        // loop never started. Joining here is then always safe.
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            self.lock_state().quit = true;
            self.wake.notify_all();
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}
