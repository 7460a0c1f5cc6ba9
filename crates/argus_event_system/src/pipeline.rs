//! Pipeline routing state carried inside an [`Event`].
//!
//! A pipeline event owns its remaining route: a queue of weak handler
//! references that is consumed front to back as delivery progresses.
//! Because the route travels with the event, delivery can hop across
//! threads and pause/resume without any central coordinator. The
//! producer that created the event is notified exactly once when the
//! route is exhausted so it can recycle per-event resources.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::event::{Event, EventHandler};

/// Source-side hooks invoked by the delivery machinery.
///
/// Producers hand out events and may pool or meter them; `recycle`
/// fires exactly once per event when its route completes.
pub trait PipelineEventProducer: Send + Sync {
    /// The event finished its route (every processor ran or the route
    /// was empty).
    fn recycle(&self, _event: &Event) {}

    /// A processor paused delivery and intends to resume later.
    fn pause_dispatch(&self, _processor: &str) {}
}

/// Routing state slot. Private to this crate; events expose it through
/// the methods below.
#[derive(Clone)]
pub(crate) struct PipelineRoute {
    pub(crate) pipeline_name: String,
    pub(crate) processors: VecDeque<Weak<dyn EventHandler>>,
    pub(crate) producer: Option<Weak<dyn PipelineEventProducer>>,
    pub(crate) start_deliver: bool,
    pub(crate) input_files: Vec<String>,
    pub(crate) delete_files: Vec<String>,
}

impl std::fmt::Debug for PipelineRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRoute")
            .field("pipeline_name", &self.pipeline_name)
            .field("remaining", &self.processors.len())
            .field("start_deliver", &self.start_deliver)
            .finish()
    }
}

impl Event {
    /// Stamps a delivery route onto this event, turning it into a
    /// pipeline event. Progress flags reset because a new traversal
    /// begins. Any previously attached producer is kept.
    pub fn set_pipeline_route(
        &mut self,
        pipeline_name: impl Into<String>,
        processors: VecDeque<Weak<dyn EventHandler>>,
        start_deliver: bool,
    ) {
        let producer = self.route.take().and_then(|r| r.producer);
        self.clear_progress();
        self.route = Some(PipelineRoute {
            pipeline_name: pipeline_name.into(),
            processors,
            producer,
            start_deliver,
            input_files: Vec::new(),
            delete_files: Vec::new(),
        });
    }

    /// Binds the producer notified when the route completes. Creates an
    /// empty route if the event has none yet.
    pub fn set_pipeline_producer(&mut self, producer: Weak<dyn PipelineEventProducer>) {
        match self.route.as_mut() {
            Some(route) => route.producer = Some(producer),
            None => {
                self.route = Some(PipelineRoute {
                    pipeline_name: String::new(),
                    processors: VecDeque::new(),
                    producer: Some(producer),
                    start_deliver: false,
                    input_files: Vec::new(),
                    delete_files: Vec::new(),
                });
            }
        }
    }

    pub(crate) fn producer_ref(&self) -> Option<Weak<dyn PipelineEventProducer>> {
        self.route.as_ref().and_then(|r| r.producer.clone())
    }

    /// Name of the pipeline this event is traversing, empty otherwise.
    pub fn pipeline_name(&self) -> &str {
        self.route.as_ref().map(|r| r.pipeline_name.as_str()).unwrap_or("")
    }

    /// Processors still ahead of this event on its route.
    pub fn remaining_processors(&self) -> usize {
        self.route.as_ref().map(|r| r.processors.len()).unwrap_or(0)
    }

    /// Whether delivery along the stamped route has begun.
    pub fn start_deliver(&self) -> bool {
        self.route.as_ref().map(|r| r.start_deliver).unwrap_or(false)
    }

    pub fn add_input_file(&mut self, path: impl Into<String>) {
        if let Some(route) = self.route.as_mut() {
            route.input_files.push(path.into());
        }
    }

    pub fn input_files(&self) -> &[String] {
        self.route.as_ref().map(|r| r.input_files.as_slice()).unwrap_or(&[])
    }

    pub fn add_delete_file(&mut self, path: impl Into<String>) {
        if let Some(route) = self.route.as_mut() {
            route.delete_files.push(path.into());
        }
    }

    pub fn delete_files(&self) -> &[String] {
        self.route.as_ref().map(|r| r.delete_files.as_slice()).unwrap_or(&[])
    }

    /// Snapshot for cooperative pause: clones the event with its
    /// remaining route so a processor that returned `false` can hand
    /// the copy somewhere and resume later via
    /// [`resume_pipeline_delivery`]. Both the original and the copy are
    /// marked pending.
    pub fn suspend(&mut self) -> Event {
        self.mark_pending();
        let mut snapshot = self.clone();
        snapshot.mark_pending();
        snapshot
    }

    /// Marks the route complete and notifies the producer. Idempotent:
    /// only the first call reaches the producer.
    pub fn finish(&mut self) {
        if self.has_finished() {
            return;
        }
        self.mark_finished();
        if let Some(producer) = self.producer_ref().and_then(|p| p.upgrade()) {
            producer.recycle(&*self);
        }
    }

    fn take_next_processor(&mut self) -> Option<Weak<dyn EventHandler>> {
        self.route.as_mut().and_then(|r| r.processors.pop_front())
    }
}

/// Drives a pipeline event along its route on the calling thread.
///
/// Each processor is popped from the route before it runs, so a
/// processor observing the event sees only the downstream remainder.
/// Expired processors are skipped. A processor returning `false`
/// pauses delivery with the event marked pending; it is then the
/// pausing processor's job to resubmit a snapshot later. When the
/// route is exhausted the event finishes and its producer is told to
/// recycle it.
pub fn deliver_pipeline_event(mut event: Event) {
    loop {
        let next = match event.take_next_processor() {
            Some(slot) => slot,
            None => {
                trace!(pipeline = %event.pipeline_name(), "route exhausted, finishing");
                event.finish();
                return;
            }
        };
        let Some(handler) = next.upgrade() else {
            trace!(pipeline = %event.pipeline_name(), "skipping expired processor");
            continue;
        };
        if !handler.on_event(&mut event) {
            event.mark_pending();
            if let Some(producer) = producer_of(&event) {
                producer.pause_dispatch(handler.handler_name());
            }
            debug!(
                pipeline = %event.pipeline_name(),
                handler = handler.handler_name(),
                "pipeline delivery paused"
            );
            return;
        }
    }
}

/// Continues delivery of a previously suspended pipeline event.
pub fn resume_pipeline_delivery(event: Event) {
    debug!(pipeline = %event.pipeline_name(), "resuming pipeline delivery");
    deliver_pipeline_event(event);
}

/// Upgrades and clones the producer handle, if the event has one.
pub fn producer_of(event: &Event) -> Option<Arc<dyn PipelineEventProducer>> {
    event.producer_ref().and_then(|p| p.upgrade())
}
