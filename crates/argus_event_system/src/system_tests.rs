//! Cross-module behavior tests: loops, queues, and pipeline delivery
//! working together the way the platform wires them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::dispatch_queue::EventDispatchQueue;
use crate::event::{Event, EventHandler, MessageType};
use crate::event_loop::EventLoop;
use crate::listener::{EventIdRange, EventListener, ListenerRegistry};
use crate::pipeline::{deliver_pipeline_event, resume_pipeline_delivery};
use crate::create_work_loop;

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

struct CountingHandler {
    calls: AtomicUsize,
}

impl EventHandler for CountingHandler {
    fn on_event(&self, event: &mut Event) -> bool {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        event.set_int_value("firings", n as i64);
        true
    }
}

#[test]
fn periodic_dispatch_mutates_one_shared_event() {
    let work_loop = create_work_loop("shared");
    let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0) });

    work_loop.add_timer_event(
        Some(handler.clone()),
        Some(Event::new("t", MessageType::Statistics, 1)),
        Duration::from_millis(25),
        true,
    );

    assert!(wait_until(Duration::from_secs(2), || {
        handler.calls.load(Ordering::SeqCst) >= 3
    }));
    work_loop.stop();
}

#[test]
fn loop_task_can_feed_the_broadcast_queue() {
    struct Sink {
        seen: AtomicUsize,
    }
    impl EventListener for Sink {
        fn listener_name(&self) -> &str {
            "sink"
        }
        fn on_unordered_event(&self, _event: &Event) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    let registry = Arc::new(ListenerRegistry::new());
    let sink = Arc::new(Sink { seen: AtomicUsize::new(0) });
    let sink_dyn: Arc<dyn EventListener> = sink.clone();
    registry.register(&sink_dyn, false);
    registry.add_id_interest("sink", MessageType::Fault, &[EventIdRange::new(0, 10)]);

    let queue = Arc::new(EventDispatchQueue::new("bridge", registry));
    queue.start();
    let work_loop = create_work_loop("feeder");

    let feeder = queue.clone();
    work_loop.add_timer_task(
        move || feeder.enqueue(Event::new("loop", MessageType::Fault, 3)),
        Duration::from_millis(20),
        true,
    );

    assert!(wait_until(Duration::from_secs(2), || {
        sink.seen.load(Ordering::SeqCst) >= 2
    }));
    work_loop.stop();
    queue.stop();
}

#[test]
fn suspended_pipeline_event_resumes_on_another_thread() {
    struct Stage {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        pause_here: bool,
        parked: Arc<Mutex<Option<Event>>>,
    }

    impl EventHandler for Stage {
        fn on_event(&self, event: &mut Event) -> bool {
            self.log.lock().unwrap().push(self.name.clone());
            if self.pause_here {
                *self.parked.lock().unwrap() = Some(event.suspend());
                return false;
            }
            true
        }
        fn handler_name(&self) -> &str {
            &self.name
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let parked = Arc::new(Mutex::new(None));
    let first = Arc::new(Stage {
        name: "first".into(),
        log: log.clone(),
        pause_here: true,
        parked: parked.clone(),
    });
    let second = Arc::new(Stage {
        name: "second".into(),
        log: log.clone(),
        pause_here: false,
        parked: parked.clone(),
    });

    let route: VecDeque<Weak<dyn EventHandler>> = [
        Arc::downgrade(&first) as Weak<dyn EventHandler>,
        Arc::downgrade(&second) as Weak<dyn EventHandler>,
    ]
    .into_iter()
    .collect();

    let mut event = Event::new("src", MessageType::Raw, 9);
    event.set_pipeline_route("two_stage", route, true);
    deliver_pipeline_event(event);

    assert_eq!(*log.lock().unwrap(), vec!["first"]);
    let snapshot = parked.lock().unwrap().take().unwrap();
    assert!(snapshot.has_pending());

    // Resume from a different thread, as a real pauser would.
    let resume_log = log.clone();
    let resumer = thread::spawn(move || resume_pipeline_delivery(snapshot));
    resumer.join().unwrap();
    assert_eq!(*resume_log.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn sync_result_waits_across_loops() {
    let loop_a = create_work_loop("loop_a");
    let loop_b = create_work_loop("loop_b");
    let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0) });

    // A task on loop A blocks on a dispatch executed by loop B.
    let target: Arc<dyn EventHandler> = handler.clone();
    let loop_b_ref = loop_b.clone();
    let outcome = Arc::new(Mutex::new(None));
    let outcome_probe = outcome.clone();
    loop_a.add_task(move || {
        let verdict = loop_b_ref
            .add_event_for_result(
                Some(target.clone()),
                Some(Event::new("t", MessageType::Raw, 1)),
            )
            .wait();
        *outcome_probe.lock().unwrap() = Some(verdict);
    });

    assert!(wait_until(Duration::from_secs(2), || {
        outcome.lock().unwrap().is_some()
    }));
    assert_eq!(*outcome.lock().unwrap(), Some(true));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    loop_a.stop();
    loop_b.stop();
}
