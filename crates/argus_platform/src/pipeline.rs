//! Ordered delivery chains over hosted plugins.
//!
//! A pipeline is a named sequence of weak plugin references. It never
//! keeps plugins alive and never snapshots them ahead of time: each
//! event stamps the live sequence into its own route at delivery time,
//! so unloaded processors simply vanish from future traversals.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use argus_event_system::{deliver_pipeline_event, Event, EventHandler};

use crate::context::{PlatformContext, PlatformError};
use crate::plugin::{PluginContext, PluginEntry};

pub struct Pipeline {
    name: String,
    processors: Mutex<Vec<Weak<PluginEntry>>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, processors: Vec<Weak<PluginEntry>>) -> Self {
        Pipeline { name: name.into(), processors: Mutex::new(processors) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current processor slots, expired ones included.
    pub fn processor_count(&self) -> usize {
        self.lock_processors().len()
    }

    /// Snapshot of the current sequence.
    pub fn sequence(&self) -> Vec<Weak<PluginEntry>> {
        self.lock_processors().clone()
    }

    /// Names of the live processors, in order.
    pub fn processor_names(&self) -> Vec<String> {
        self.lock_processors()
            .iter()
            .filter_map(|slot| slot.upgrade())
            .map(|entry| entry.name().to_string())
            .collect()
    }

    pub fn append_processor(&self, plugin: &Arc<PluginEntry>) {
        self.lock_processors().push(Arc::downgrade(plugin));
        debug!(pipeline = %self.name, plugin = %plugin.name(), "processor appended");
    }

    /// Removes every slot referring to `plugin`. Returns whether any
    /// slot was removed.
    pub fn remove_processor(&self, plugin: &Arc<PluginEntry>) -> bool {
        let mut processors = self.lock_processors();
        let before = processors.len();
        processors.retain(|slot| !std::ptr::eq(slot.as_ptr(), Arc::as_ptr(plugin)));
        processors.len() != before
    }

    /// Admission: asks the first live processor whether it would take
    /// this event right now.
    pub fn can_process_event(&self, event: &Event) -> bool {
        let first = self
            .lock_processors()
            .iter()
            .find_map(|slot| slot.upgrade());
        match first {
            Some(entry) => entry.can_process_more_events() && entry.can_process_event(event),
            None => false,
        }
    }

    /// Stamps the live sequence onto `event` and delivers it on the
    /// calling thread.
    pub fn process_event(&self, mut event: Event) {
        let route: VecDeque<Weak<dyn EventHandler>> = self
            .lock_processors()
            .iter()
            .map(|slot| slot.clone() as Weak<dyn EventHandler>)
            .collect();
        event.set_pipeline_route(self.name.clone(), route, true);
        deliver_pipeline_event(event);
    }

    fn lock_processors(&self) -> std::sync::MutexGuard<'_, Vec<Weak<PluginEntry>>> {
        self.processors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("processors", &self.processor_count())
            .finish()
    }
}

/// Stamps the route of `pipeline_name` onto `event` on behalf of
/// `caller`.
///
/// With `deliver_from_current` set, the route starts right after the
/// caller's position in the pipeline, matching "hand this event to
/// whoever comes after me"; the caller is located by entry identity,
/// not by name. Otherwise the route is the full sequence. A caller
/// asking to continue from a pipeline it is not part of gets the full
/// sequence with a log.
pub fn fill_pipeline_info(
    caller: &PluginContext,
    pipeline_name: &str,
    event: &mut Event,
    deliver_from_current: bool,
) -> Result<(), PlatformError> {
    let platform = caller
        .platform()
        .ok_or_else(|| PlatformError::ExpiredReference { name: caller.name().to_string() })?;
    let sequence = platform
        .pipeline_sequence(pipeline_name)
        .ok_or_else(|| PlatformError::UnknownPipeline { name: pipeline_name.to_string() })?;

    let remainder: Vec<Weak<PluginEntry>> = if deliver_from_current {
        let caller_ptr = caller.entry_ptr();
        let position = sequence
            .iter()
            .position(|slot| std::ptr::eq(slot.as_ptr(), caller_ptr));
        match position {
            Some(index) => sequence[index + 1..].to_vec(),
            None => {
                warn!(
                    plugin = caller.name(),
                    pipeline = pipeline_name,
                    "caller not part of pipeline, using full sequence"
                );
                sequence
            }
        }
    } else {
        sequence
    };

    let route: VecDeque<Weak<dyn EventHandler>> = remainder
        .into_iter()
        .map(|slot| slot as Weak<dyn EventHandler>)
        .collect();
    event.set_pipeline_route(pipeline_name.to_string(), route, deliver_from_current);
    Ok(())
}

/// Clones `source` into a fresh pipeline event bound to
/// `pipeline_name`, with progress flags cleared for the new traversal.
/// The sender and payload of the original are preserved.
pub fn repack_pipeline_event(
    caller: &PluginContext,
    source: &Event,
    pipeline_name: &str,
    deliver_from_current: bool,
) -> Result<Event, PlatformError> {
    let mut repacked = source.clone();
    fill_pipeline_info(caller, pipeline_name, &mut repacked, deliver_from_current)?;
    Ok(repacked)
}
