//! # Argus Event System
//!
//! Process-local event plumbing for the Argus plugin platform: a plain
//! data [`Event`] model, thread-backed [`EventLoop`]s with delayed and
//! periodic scheduling, pipeline delivery that travels with the event,
//! and two fan-out paths for unordered events (the registry-backed
//! [`EventDispatchQueue`] and the type-keyed [`EventDispatcher`]).
//!
//! Everything here is synchronous and in-memory. Loops own their
//! threads; cross-thread hand-off happens through channels and the
//! loops' schedules, never through shared mutable state in handlers.
//!
//! ## Quick start
//!
//! ```
//! use argus_event_system::{create_work_loop, Event, MessageType};
//! use std::time::Duration;
//!
//! let mut event = Event::new("docs", MessageType::Raw, 1);
//! event.set_value("status", "ok");
//! assert_eq!(event.value("status"), "ok");
//!
//! let work_loop = create_work_loop("docs");
//! let seq = work_loop.add_timer_task(|| {}, Duration::from_millis(10), false);
//! assert!(seq > 0);
//! work_loop.stop();
//! ```

pub mod dispatch_queue;
pub mod dispatcher;
pub mod event;
pub mod event_loop;
pub mod listener;
pub mod pipeline;
pub mod poller;

#[cfg(test)]
mod system_tests;

pub use dispatch_queue::EventDispatchQueue;
pub use dispatcher::EventDispatcher;
pub use event::{current_millis, Event, EventHandler, ManageType, MessageType, TraceInfo};
pub use event_loop::{EventLoop, EventResult};
pub use listener::{EventIdRange, EventListener, ListenerRegistry};
pub use pipeline::{
    deliver_pipeline_event, producer_of, resume_pipeline_delivery, PipelineEventProducer,
};
pub use poller::{
    FileDescriptorEventCallback, FD_EVENT_ERROR, FD_EVENT_HANGUP, FD_EVENT_READ, FD_EVENT_WRITE,
    MAX_WATCHED_FDS,
};

use std::sync::Arc;

/// Creates and starts a named work loop.
pub fn create_work_loop(name: &str) -> Arc<EventLoop> {
    let work_loop = Arc::new(EventLoop::new(name));
    work_loop.start();
    work_loop
}
