//! Listener interest records and the shared registry behind unordered
//! event fan-out.
//!
//! Interests come in two shapes: id intervals per message type, and
//! name fragments matched against the `domain_eventName` composite.
//! Records are keyed by listener name and may exist before the
//! listener itself registers, so configuration can declare interest
//! ahead of instantiation; such records stay unbound and receive
//! nothing until a target is attached.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::debug;

use crate::event::{Event, MessageType};

/// Consumer of broadcast (unordered) events.
pub trait EventListener: Send + Sync {
    fn listener_name(&self) -> &str;

    fn on_unordered_event(&self, event: &Event);

    /// Live id-interval interest for `message_type`; `None` when this
    /// listener has no id-based interest there. Queried at dispatch
    /// time by [`crate::dispatcher::EventDispatcher`].
    fn id_ranges_for(&self, _message_type: MessageType) -> Option<Vec<EventIdRange>> {
        None
    }
}

/// Closed interval of event ids, `begin..=end`.
///
/// Interval sets per message type are kept non-overlapping, ordered by
/// `end`, which lets containment resolve against at most one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventIdRange {
    pub begin: u32,
    pub end: u32,
}

impl EventIdRange {
    pub fn new(begin: u32, end: u32) -> Self {
        if begin <= end {
            EventIdRange { begin, end }
        } else {
            EventIdRange { begin: end, end: begin }
        }
    }

    pub fn single(id: u32) -> Self {
        EventIdRange { begin: id, end: id }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.begin <= id && id <= self.end
    }
}

impl Ord for EventIdRange {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.end.cmp(&other.end).then_with(|| self.begin.cmp(&other.begin))
    }
}

impl PartialOrd for EventIdRange {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Finds a containing interval in an end-ordered, non-overlapping set.
fn set_contains(set: &BTreeSet<EventIdRange>, id: u32) -> bool {
    // First interval whose end >= id is the only one that can hold id.
    let floor = EventIdRange { begin: 0, end: id };
    set.range((Bound::Included(floor), Bound::Unbounded))
        .next()
        .map(|r| r.contains(id))
        .unwrap_or(false)
}

/// One listener's registry record.
struct ListenerRecord {
    target: Option<Weak<dyn EventListener>>,
    is_plugin: bool,
    id_interests: HashMap<MessageType, BTreeSet<EventIdRange>>,
    name_interests: HashMap<MessageType, BTreeSet<String>>,
}

impl ListenerRecord {
    fn unbound() -> Self {
        ListenerRecord {
            target: None,
            is_plugin: false,
            id_interests: HashMap::new(),
            name_interests: HashMap::new(),
        }
    }

    fn matches(&self, message_type: MessageType, event_id: u32, composite_name: &str) -> bool {
        if let Some(needles) = self.name_interests.get(&message_type) {
            if needles.iter().any(|n| composite_name.contains(n.as_str())) {
                return true;
            }
        }
        if let Some(ranges) = self.id_interests.get(&message_type) {
            if set_contains(ranges, event_id) {
                return true;
            }
        }
        false
    }
}

/// Name-keyed table of listener records, shared between the platform
/// and its dispatch queue.
#[derive(Default)]
pub struct ListenerRegistry {
    records: DashMap<String, ListenerRecord>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a live listener to its record, creating the record if the
    /// name is new. Interests registered earlier under the same name
    /// are kept.
    pub fn register(&self, listener: &Arc<dyn EventListener>, is_plugin: bool) {
        let name = listener.listener_name().to_string();
        let mut record = self.records.entry(name).or_insert_with(ListenerRecord::unbound);
        record.target = Some(Arc::downgrade(listener));
        record.is_plugin = is_plugin;
    }

    /// Attaches a target to an existing (or fresh) record by name.
    pub fn bind(&self, name: &str, target: Weak<dyn EventListener>, is_plugin: bool) {
        let mut record = self
            .records
            .entry(name.to_string())
            .or_insert_with(ListenerRecord::unbound);
        record.target = Some(target);
        record.is_plugin = is_plugin;
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.records
            .get(name)
            .map(|r| r.target.is_some())
            .unwrap_or(false)
    }

    /// Adds id-interval interest for `name`, merging with what is
    /// already recorded for that message type.
    pub fn add_id_interest(&self, name: &str, message_type: MessageType, ranges: &[EventIdRange]) {
        let mut record = self
            .records
            .entry(name.to_string())
            .or_insert_with(ListenerRecord::unbound);
        let set = record.id_interests.entry(message_type).or_default();
        for range in ranges {
            set.insert(*range);
        }
    }

    /// Adds `domain_eventName` fragment interest for `name`.
    pub fn add_name_interest(&self, name: &str, message_type: MessageType, needles: &[String]) {
        let mut record = self
            .records
            .entry(name.to_string())
            .or_insert_with(ListenerRecord::unbound);
        let set = record.name_interests.entry(message_type).or_default();
        for needle in needles {
            set.insert(needle.clone());
        }
    }

    pub fn id_ranges(&self, name: &str, message_type: MessageType) -> Option<Vec<EventIdRange>> {
        let record = self.records.get(name)?;
        let set = record.id_interests.get(&message_type)?;
        if set.is_empty() {
            return None;
        }
        Some(set.iter().copied().collect())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.records.remove(name).is_some()
    }

    /// Live targets whose interest matches the given event identity.
    pub fn targets_for(
        &self,
        message_type: MessageType,
        event_id: u32,
        composite_name: &str,
    ) -> Vec<Arc<dyn EventListener>> {
        let mut targets = Vec::new();
        for record in self.records.iter() {
            if !record.matches(message_type, event_id, composite_name) {
                continue;
            }
            if let Some(listener) = record.target.as_ref().and_then(|t| t.upgrade()) {
                targets.push(listener);
            }
        }
        targets
    }

    /// Convenience dispatch used by tests and diagnostics.
    pub fn targets_for_event(&self, event: &Event) -> Vec<Arc<dyn EventListener>> {
        self.targets_for(event.message_type(), event.event_id(), &event.composite_name())
    }

    /// Drops records whose bound target has expired. Unbound records
    /// stay: they hold interest declared ahead of instantiation.
    pub fn clear_invalid(&self) -> usize {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|r| matches!(r.target.as_ref(), Some(t) if t.strong_count() == 0))
            .map(|r| r.key().clone())
            .collect();
        for name in &stale {
            debug!(listener = %name, "dropping expired listener record");
            self.records.remove(name);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
