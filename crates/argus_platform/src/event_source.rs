//! Event sources: plugins that originate pipeline events.

use std::sync::Arc;

use argus_event_system::Event;

use crate::pipeline::Pipeline;

/// Producer role of a plugin. Implementors also implement
/// [`crate::plugin::Plugin`] and surface this trait through
/// [`crate::plugin::Plugin::as_event_source`].
///
/// At load time the platform hands the source every pipeline its
/// configuration names, then posts `start_event_source` onto the
/// source's work loop, so collection begins on the right thread.
pub trait EventSource: Send + Sync {
    /// Receives one of the pipelines this source feeds.
    fn add_pipeline(&self, pipeline: Arc<Pipeline>);

    /// Begin producing. Runs as work on the source's loop.
    fn start_event_source(&self) {}

    /// A produced event finished its route; release per-event
    /// resources.
    fn recycle(&self, _event: &Event) {}

    /// A downstream processor paused one of this source's events.
    fn pause_dispatch(&self, _processor: &str) {}
}
