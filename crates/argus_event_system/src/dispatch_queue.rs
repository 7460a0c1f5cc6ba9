//! FIFO broadcast queue for unordered events.
//!
//! One worker thread drains the queue and fans each event out to every
//! live listener whose registered interest matches the event identity.
//! Submission never blocks. Stopping the queue is prompt: the worker
//! abandons whatever is still queued instead of draining it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, trace};

use crate::event::{Event, ManageType};
use crate::listener::ListenerRegistry;

enum QueueItem {
    Deliver(Event),
    Shutdown,
}

struct QueueInner {
    sender: Sender<QueueItem>,
    // Receiver clone kept only for depth queries, never for recv.
    probe: Receiver<QueueItem>,
}

/// Broadcast queue feeding registered listeners, one worker per queue.
pub struct EventDispatchQueue {
    name: String,
    registry: Arc<ListenerRegistry>,
    inner: Mutex<Option<QueueInner>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl EventDispatchQueue {
    pub fn new(name: impl Into<String>, registry: Arc<ListenerRegistry>) -> Self {
        EventDispatchQueue {
            name: name.into(),
            registry,
            inner: Mutex::new(None),
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the worker. No-op if already running.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.is_some() {
            return;
        }
        let (sender, receiver) = unbounded();
        let probe = receiver.clone();
        self.running.store(true, Ordering::SeqCst);

        let registry = self.registry.clone();
        let running = self.running.clone();
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("queue-{}", self.name))
            .spawn(move || worker_loop(name, receiver, registry, running));
        match spawned {
            Ok(handle) => {
                *inner = Some(QueueInner { sender, probe });
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                debug!(queue = %self.name, "dispatch queue started");
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                error!(queue = %self.name, error = %err, "failed to spawn queue worker");
            }
        }
    }

    /// Stops the worker promptly; queued events are dropped.
    pub fn stop(&self) {
        let taken = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            self.running.store(false, Ordering::SeqCst);
            inner.take()
        };
        let Some(taken) = taken else { return };
        let _ = taken.sender.send(QueueItem::Shutdown);
        drop(taken);

        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        debug!(queue = %self.name, "dispatch queue stopped");
    }

    /// Appends an event for broadcast. Silently dropped when the queue
    /// is not running.
    pub fn enqueue(&self, event: Event) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.as_ref() {
            Some(queue) => {
                let _ = queue.sender.send(QueueItem::Deliver(event));
            }
            None => {
                trace!(queue = %self.name, "event dropped, queue not running");
            }
        }
    }

    /// Events admitted but not yet fanned out.
    pub fn wait_queue_size(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|queue| queue.probe.len())
            .unwrap_or(0)
    }
}

impl Drop for EventDispatchQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    name: String,
    receiver: Receiver<QueueItem>,
    registry: Arc<ListenerRegistry>,
    running: Arc<AtomicBool>,
) {
    while let Ok(item) = receiver.recv() {
        let event = match item {
            QueueItem::Shutdown => break,
            QueueItem::Deliver(event) => event,
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if event.manage_type() != ManageType::Unordered {
            trace!(queue = %name, "ordered event skipped by broadcast queue");
            continue;
        }
        fan_out(&name, &registry, &event);
    }
    trace!(queue = %name, "queue worker exited");
}

fn fan_out(name: &str, registry: &ListenerRegistry, event: &Event) {
    let targets = registry.targets_for_event(event);
    if targets.is_empty() {
        trace!(
            queue = %name,
            event_id = event.event_id(),
            "no interested listeners, event dropped"
        );
        return;
    }
    for listener in targets {
        let delivery = catch_unwind(AssertUnwindSafe(|| listener.on_unordered_event(event)));
        if delivery.is_err() {
            error!(
                queue = %name,
                listener = listener.listener_name(),
                "listener panicked during broadcast"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageType;
    use crate::listener::{EventIdRange, EventListener};
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    struct Collector {
        name: String,
        seen: Mutex<Vec<u32>>,
        delay: Duration,
    }

    impl Collector {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Collector {
                name: name.into(),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }
    }

    impl EventListener for Collector {
        fn listener_name(&self) -> &str {
            &self.name
        }

        fn on_unordered_event(&self, event: &Event) {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.seen.lock().unwrap().push(event.event_id());
        }
    }

    fn registry_with(collector: &Arc<Collector>, upto: u32) -> Arc<ListenerRegistry> {
        let registry = Arc::new(ListenerRegistry::new());
        let listener: Arc<dyn EventListener> = collector.clone();
        registry.register(&listener, false);
        registry.add_id_interest(
            collector.name.as_str(),
            MessageType::Fault,
            &[EventIdRange::new(0, upto)],
        );
        registry
    }

    #[test]
    fn events_fan_out_in_submission_order() {
        let collector = Collector::new("in_order");
        let registry = registry_with(&collector, 10_000);
        let queue = EventDispatchQueue::new("test", registry);
        queue.start();

        for id in 0..1000u32 {
            queue.enqueue(Event::new("t", MessageType::Fault, id));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            collector.seen.lock().unwrap().len() == 1000
        }));
        let seen = collector.seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        queue.stop();
    }

    #[test]
    fn ordered_events_do_not_broadcast() {
        let collector = Collector::new("no_ordered");
        let registry = registry_with(&collector, 100);
        let queue = EventDispatchQueue::new("test", registry);
        queue.start();

        queue.enqueue(
            Event::new("t", MessageType::Fault, 1).with_manage_type(ManageType::Ordered),
        );
        queue.enqueue(Event::new("t", MessageType::Fault, 2));

        assert!(wait_until(Duration::from_secs(2), || {
            !collector.seen.lock().unwrap().is_empty()
        }));
        assert_eq!(*collector.seen.lock().unwrap(), vec![2]);
        queue.stop();
    }

    #[test]
    fn enqueue_after_stop_is_silent() {
        let collector = Collector::new("stopped");
        let registry = registry_with(&collector, 100);
        let queue = EventDispatchQueue::new("test", registry);
        queue.start();
        queue.stop();

        queue.enqueue(Event::new("t", MessageType::Fault, 1));
        assert_eq!(queue.wait_queue_size(), 0);
        assert!(collector.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_abandons_queued_backlog() {
        let collector = Arc::new(Collector {
            name: "slow".into(),
            seen: Mutex::new(Vec::new()),
            delay: Duration::from_millis(50),
        });
        let registry = registry_with(&collector, 100);
        let queue = EventDispatchQueue::new("test", registry);
        queue.start();

        for id in 0..10u32 {
            queue.enqueue(Event::new("t", MessageType::Fault, id));
        }
        assert!(wait_until(Duration::from_secs(2), || {
            !collector.seen.lock().unwrap().is_empty()
        }));
        queue.stop();

        let delivered = collector.seen.lock().unwrap().len();
        assert!(delivered < 10, "delivered {delivered} events");
    }

    #[test]
    fn panicking_listener_does_not_stall_the_queue() {
        struct Bomb;
        impl EventListener for Bomb {
            fn listener_name(&self) -> &str {
                "bomb"
            }
            fn on_unordered_event(&self, _event: &Event) {
                panic!("listener failure");
            }
        }

        let collector = Collector::new("survivor");
        let registry = registry_with(&collector, 100);
        let bomb: Arc<dyn EventListener> = Arc::new(Bomb);
        registry.register(&bomb, false);
        registry.add_id_interest("bomb", MessageType::Fault, &[EventIdRange::new(0, 100)]);

        let queue = EventDispatchQueue::new("test", registry);
        queue.start();
        queue.enqueue(Event::new("t", MessageType::Fault, 1));
        queue.enqueue(Event::new("t", MessageType::Fault, 2));

        assert!(wait_until(Duration::from_secs(2), || {
            collector.seen.lock().unwrap().len() == 2
        }));
        queue.stop();
    }
}
