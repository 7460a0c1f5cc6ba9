//! Message-type keyed dispatcher with live interest queries.
//!
//! Unlike the registry-backed broadcast queue, an [`EventDispatcher`]
//! tracks a fixed set of message types and asks each candidate for its
//! id intervals *at dispatch time*, so listeners whose interest evolves
//! are honored without re-registration. Listeners are held weakly;
//! expired entries are skipped during dispatch and reaped by
//! [`EventDispatcher::clear_invalid_listeners`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::event::{Event, MessageType};
use crate::listener::EventListener;

struct RegisteredListener {
    name: String,
    target: Weak<dyn EventListener>,
}

pub struct EventDispatcher {
    types: Vec<MessageType>,
    channels: Mutex<HashMap<MessageType, Vec<RegisteredListener>>>,
}

impl EventDispatcher {
    /// Dispatcher for the given message types; events of other types
    /// are ignored.
    pub fn new(types: impl IntoIterator<Item = MessageType>) -> Self {
        EventDispatcher {
            types: types.into_iter().collect(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracked_types(&self) -> &[MessageType] {
        &self.types
    }

    /// Admits `candidate` for every tracked type where it currently
    /// declares id interest. Names already present for a type are not
    /// registered twice.
    pub fn register_listener(&self, candidate: &Arc<dyn EventListener>) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        for message_type in &self.types {
            let has_interest = candidate
                .id_ranges_for(*message_type)
                .map(|ranges| !ranges.is_empty())
                .unwrap_or(false);
            if !has_interest {
                continue;
            }
            let list = channels.entry(*message_type).or_default();
            if list.iter().any(|r| r.name == candidate.listener_name()) {
                continue;
            }
            debug!(
                listener = candidate.listener_name(),
                ?message_type,
                "listener registered for dispatch"
            );
            list.push(RegisteredListener {
                name: candidate.listener_name().to_string(),
                target: Arc::downgrade(candidate),
            });
        }
    }

    /// Delivers `event` to every live registered listener whose
    /// *current* interval set contains the event id.
    pub fn dispatch_event(&self, event: &Event) {
        let message_type = event.message_type();
        if !self.types.contains(&message_type) {
            trace!(?message_type, "dispatcher does not track this type");
            return;
        }
        let targets: Vec<Arc<dyn EventListener>> = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels
                .get(&message_type)
                .map(|list| {
                    list.iter()
                        .filter_map(|r| r.target.upgrade())
                        .filter(|listener| {
                            listener
                                .id_ranges_for(message_type)
                                .map(|ranges| {
                                    ranges.iter().any(|range| range.contains(event.event_id()))
                                })
                                .unwrap_or(false)
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        for listener in targets {
            listener.on_unordered_event(event);
        }
    }

    /// Drops registrations whose listener has been destroyed. Returns
    /// how many entries were removed.
    pub fn clear_invalid_listeners(&self) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for list in channels.values_mut() {
            let before = list.len();
            list.retain(|r| r.target.strong_count() > 0);
            removed += before - list.len();
        }
        removed
    }

    pub fn listener_count(&self, message_type: MessageType) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_type)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::EventIdRange;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ShiftingListener {
        name: String,
        ranges: Mutex<Vec<EventIdRange>>,
        hits: AtomicUsize,
    }

    impl ShiftingListener {
        fn new(name: &str, ranges: Vec<EventIdRange>) -> Arc<Self> {
            Arc::new(ShiftingListener {
                name: name.into(),
                ranges: Mutex::new(ranges),
                hits: AtomicUsize::new(0),
            })
        }

        fn set_ranges(&self, ranges: Vec<EventIdRange>) {
            *self.ranges.lock().unwrap() = ranges;
        }
    }

    impl EventListener for ShiftingListener {
        fn listener_name(&self) -> &str {
            &self.name
        }

        fn on_unordered_event(&self, _event: &Event) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }

        fn id_ranges_for(&self, message_type: MessageType) -> Option<Vec<EventIdRange>> {
            if message_type != MessageType::Fault {
                return None;
            }
            let ranges = self.ranges.lock().unwrap();
            if ranges.is_empty() {
                None
            } else {
                Some(ranges.clone())
            }
        }
    }

    fn fault(id: u32) -> Event {
        Event::new("t", MessageType::Fault, id)
    }

    #[test]
    fn evolving_interest_is_queried_live() {
        let dispatcher = EventDispatcher::new([MessageType::Fault]);
        let a = ShiftingListener::new("a", vec![EventIdRange::new(1, 10)]);
        let b = ShiftingListener::new("b", vec![EventIdRange::single(2)]);
        let a_dyn: Arc<dyn EventListener> = a.clone();
        let b_dyn: Arc<dyn EventListener> = b.clone();
        dispatcher.register_listener(&a_dyn);
        dispatcher.register_listener(&b_dyn);

        let mut progression = Vec::new();
        for id in 1..=4u32 {
            if id == 3 {
                // Shrink a's interest mid-stream; the dispatcher must
                // see the new set, not the one seen at registration.
                a.set_ranges(vec![EventIdRange::new(1, 2)]);
            }
            dispatcher.dispatch_event(&fault(id));
            progression.push((
                a.hits.load(Ordering::SeqCst),
                b.hits.load(Ordering::SeqCst),
            ));
        }
        assert_eq!(progression, vec![(1, 0), (2, 1), (2, 1), (2, 1)]);
    }

    #[test]
    fn registration_requires_current_interest() {
        let dispatcher = EventDispatcher::new([MessageType::Fault]);
        let silent = ShiftingListener::new("silent", Vec::new());
        let silent_dyn: Arc<dyn EventListener> = silent.clone();
        dispatcher.register_listener(&silent_dyn);
        assert_eq!(dispatcher.listener_count(MessageType::Fault), 0);

        silent.set_ranges(vec![EventIdRange::single(1)]);
        dispatcher.register_listener(&silent_dyn);
        assert_eq!(dispatcher.listener_count(MessageType::Fault), 1);

        // Same name never registers twice.
        dispatcher.register_listener(&silent_dyn);
        assert_eq!(dispatcher.listener_count(MessageType::Fault), 1);
    }

    #[test]
    fn untracked_types_are_ignored() {
        let dispatcher = EventDispatcher::new([MessageType::Fault]);
        let a = ShiftingListener::new("a", vec![EventIdRange::new(1, 10)]);
        let a_dyn: Arc<dyn EventListener> = a.clone();
        dispatcher.register_listener(&a_dyn);

        dispatcher.dispatch_event(&Event::new("t", MessageType::Raw, 5));
        assert_eq!(a.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_invalid_listeners_reaps_dropped_targets() {
        let dispatcher = EventDispatcher::new([MessageType::Fault]);
        {
            let transient = ShiftingListener::new("transient", vec![EventIdRange::single(1)]);
            let transient_dyn: Arc<dyn EventListener> = transient.clone();
            dispatcher.register_listener(&transient_dyn);
            assert_eq!(dispatcher.listener_count(MessageType::Fault), 1);
        }
        dispatcher.dispatch_event(&fault(1));
        assert_eq!(dispatcher.clear_invalid_listeners(), 1);
        assert_eq!(dispatcher.listener_count(MessageType::Fault), 0);
    }
}
