//! Hosted plugin model: the [`Plugin`] trait, the per-plugin
//! [`PluginContext`], and the [`PluginEntry`] wrapper the platform
//! routes through.
//!
//! An entry outlives its plugin instance. Static and dynamic plugins
//! keep one resident instance; proxy entries build theirs on first
//! use and may drop it again after sitting idle, so pipelines and
//! registries hold weak references to entries rather than instances.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use argus_event_system::{
    current_millis, Event, EventHandler, EventIdRange, EventListener, EventLoop, MessageType,
    PipelineEventProducer,
};

use crate::context::PlatformContext;
use crate::event_source::EventSource;

/// A hosted diagnostic plugin.
///
/// Implementations are constructed by a registered factory, receive
/// lifecycle calls from the platform, and consume events on their
/// bound work loop. All methods take `&self`: plugins manage their own
/// interior state and must be safe to call from the loop thread while
/// other threads hold the same `Arc`.
pub trait Plugin: Send + Sync {
    fn version(&self) -> &str {
        ""
    }

    /// Last chance to veto loading, checked before the entry is
    /// published.
    fn ready_to_load(&self) -> bool {
        true
    }

    fn on_load(&self) {}

    fn on_unload(&self) {}

    /// Consumes one event. The return value reports whether the event
    /// was handled; in a pipeline, `false` parks the event at this
    /// processor.
    fn on_event(&self, event: &mut Event) -> bool;

    fn can_process_event(&self, _event: &Event) -> bool {
        true
    }

    fn can_process_more_events(&self) -> bool {
        true
    }

    /// Broadcast delivery for plugins registered as listeners.
    fn on_event_listening_callback(&self, _event: &Event) {}

    /// Human-readable diagnostics for the platform dump.
    fn dump(&self, _args: &[String]) -> String {
        String::new()
    }

    /// Event sources return themselves here to receive pipelines.
    fn as_event_source(&self) -> Option<&dyn EventSource> {
        None
    }
}

/// Factory signature registered per plugin name.
pub type PluginCtor = fn(PluginContext) -> Arc<dyn Plugin>;

/// How an entry manages its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Built into the host, instance resident for the platform's life.
    Static,
    /// Loaded from a bundle, unloadable as a unit.
    Dynamic,
    /// Instantiated on first use, evicted after idling.
    Proxy,
}

enum PluginBody {
    Resident(OnceLock<Arc<dyn Plugin>>),
    Proxy(Mutex<Option<Arc<dyn Plugin>>>),
}

/// Per-plugin capability handle cloned into the plugin itself.
#[derive(Clone)]
pub struct PluginContext {
    name: Arc<str>,
    platform: Weak<dyn PlatformContext>,
    work_loop: Arc<EventLoop>,
    entry: Weak<PluginEntry>,
}

impl PluginContext {
    pub(crate) fn new(
        name: Arc<str>,
        platform: Weak<dyn PlatformContext>,
        work_loop: Arc<EventLoop>,
        entry: Weak<PluginEntry>,
    ) -> Self {
        PluginContext { name, platform, work_loop, entry }
    }

    /// The platform-assigned plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loop this plugin's events are dispatched on.
    pub fn work_loop(&self) -> &Arc<EventLoop> {
        &self.work_loop
    }

    pub fn platform(&self) -> Option<Arc<dyn PlatformContext>> {
        self.platform.upgrade()
    }

    pub fn entry(&self) -> Option<Arc<PluginEntry>> {
        self.entry.upgrade()
    }

    pub(crate) fn entry_ptr(&self) -> *const PluginEntry {
        self.entry.as_ptr()
    }

    /// New event stamped with this plugin as sender.
    pub fn create_event(&self, message_type: MessageType, event_id: u32) -> Event {
        Event::new(self.name.as_ref(), message_type, event_id)
    }

    /// New pipeline event whose producer is this plugin's entry, so
    /// recycle and pause notifications find their way back.
    pub fn create_pipeline_event(&self, message_type: MessageType, event_id: u32) -> Event {
        let mut event = self.create_event(message_type, event_id);
        event.set_pipeline_producer(self.entry.clone() as Weak<dyn PipelineEventProducer>);
        event
    }
}

/// Decrements the in-flight counter when a dispatch completes.
struct DispatchGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The platform's wrapper around one hosted plugin.
pub struct PluginEntry {
    ctx: PluginContext,
    kind: PluginKind,
    bundle: Option<String>,
    pipeline_names: Vec<String>,
    body: PluginBody,
    last_active: AtomicU64,
    in_flight: AtomicUsize,
}

impl PluginEntry {
    /// Builds an entry wired back to itself, so events it produces can
    /// name it as their producer. The instance is installed separately
    /// once the factory ran.
    pub(crate) fn build(
        name: &str,
        platform: Weak<dyn PlatformContext>,
        work_loop: Arc<EventLoop>,
        kind: PluginKind,
        bundle: Option<String>,
        pipeline_names: Vec<String>,
    ) -> Arc<PluginEntry> {
        let name: Arc<str> = Arc::from(name);
        Arc::new_cyclic(|weak: &Weak<PluginEntry>| PluginEntry {
            ctx: PluginContext::new(name, platform, work_loop, weak.clone()),
            kind,
            bundle,
            pipeline_names,
            body: match kind {
                PluginKind::Proxy => PluginBody::Proxy(Mutex::new(None)),
                _ => PluginBody::Resident(OnceLock::new()),
            },
            last_active: AtomicU64::new(current_millis()),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    pub fn bundle_name(&self) -> Option<&str> {
        self.bundle.as_deref()
    }

    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    pub fn work_loop(&self) -> &Arc<EventLoop> {
        self.ctx.work_loop()
    }

    pub fn pipeline_names(&self) -> &[String] {
        &self.pipeline_names
    }

    /// Dispatches currently executing against this plugin.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether a live instance is held right now. Never instantiates.
    pub fn holds_instance(&self) -> bool {
        match &self.body {
            PluginBody::Resident(cell) => cell.get().is_some(),
            PluginBody::Proxy(slot) => slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some(),
        }
    }

    pub(crate) fn install_instance(&self, instance: Arc<dyn Plugin>) {
        match &self.body {
            PluginBody::Resident(cell) => {
                let _ = cell.set(instance);
            }
            PluginBody::Proxy(slot) => {
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(instance);
            }
        }
    }

    /// The instance, without instantiating a dormant proxy.
    pub fn peek_instance(&self) -> Option<Arc<dyn Plugin>> {
        match &self.body {
            PluginBody::Resident(cell) => cell.get().cloned(),
            PluginBody::Proxy(slot) => slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// The instance, building it through the platform for dormant
    /// proxies. Refreshes the activity clock.
    pub fn instance(&self) -> Option<Arc<dyn Plugin>> {
        self.touch();
        match &self.body {
            PluginBody::Resident(cell) => cell.get().cloned(),
            PluginBody::Proxy(slot) => {
                // Held across instantiation so concurrent resolvers
                // cannot build two instances.
                let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(instance) = guard.as_ref() {
                    return Some(instance.clone());
                }
                let Some(platform) = self.ctx.platform() else {
                    warn!(plugin = %self.name(), "platform gone, cannot instantiate proxy");
                    return None;
                };
                match platform.instance_plugin_by_proxy(self.name()) {
                    Ok(instance) => {
                        debug!(plugin = %self.name(), "🧩 proxy instantiated");
                        *guard = Some(instance.clone());
                        Some(instance)
                    }
                    Err(err) => {
                        warn!(plugin = %self.name(), error = %err, "proxy instantiation failed");
                        None
                    }
                }
            }
        }
    }

    /// Version reported by the live instance, if any.
    pub fn version(&self) -> String {
        self.peek_instance()
            .map(|i| i.version().to_string())
            .unwrap_or_default()
    }

    /// Diagnostics from the plugin; instantiates dormant proxies.
    pub fn dump(&self, args: &[String]) -> String {
        self.instance().map(|i| i.dump(args)).unwrap_or_default()
    }

    pub(crate) fn touch(&self) {
        self.last_active.store(current_millis(), Ordering::SeqCst);
    }

    /// Milliseconds since the last dispatch or resolve.
    pub fn idle_millis(&self) -> u64 {
        current_millis().saturating_sub(self.last_active.load(Ordering::SeqCst))
    }

    /// Evicts the proxy instance after `max_idle` without activity.
    /// Resident entries, busy entries, and dormant proxies are left
    /// alone. Returns whether an instance was destroyed.
    pub fn destroy_instance_if_idle(&self, max_idle: Duration) -> bool {
        let PluginBody::Proxy(slot) = &self.body else {
            return false;
        };
        if self.in_flight() > 0 {
            return false;
        }
        if self.idle_millis() < max_idle.as_millis() as u64 {
            return false;
        }
        let instance = {
            let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        match instance {
            Some(instance) => {
                // on_unload outside the lock: the plugin may call back
                // into the platform while shutting down.
                instance.on_unload();
                debug!(plugin = %self.name(), "🧹 idle proxy instance destroyed");
                true
            }
            None => false,
        }
    }

    fn begin_dispatch(&self) -> DispatchGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        DispatchGuard { counter: &self.in_flight }
    }
}

impl EventHandler for PluginEntry {
    fn on_event(&self, event: &mut Event) -> bool {
        let Some(instance) = self.instance() else {
            warn!(plugin = %self.name(), "event dropped, no instance available");
            return false;
        };
        let _guard = self.begin_dispatch();
        instance.on_event(event)
    }

    fn can_process_event(&self, event: &Event) -> bool {
        self.instance()
            .map(|i| i.can_process_event(event))
            .unwrap_or(false)
    }

    fn can_process_more_events(&self) -> bool {
        self.instance()
            .map(|i| i.can_process_more_events())
            .unwrap_or(false)
    }

    fn handler_name(&self) -> &str {
        self.name()
    }
}

impl EventListener for PluginEntry {
    fn listener_name(&self) -> &str {
        self.name()
    }

    fn on_unordered_event(&self, event: &Event) {
        let Some(instance) = self.instance() else {
            warn!(plugin = %self.name(), "broadcast dropped, no instance available");
            return;
        };
        let _guard = self.begin_dispatch();
        instance.on_event_listening_callback(event);
    }

    fn id_ranges_for(&self, message_type: MessageType) -> Option<Vec<EventIdRange>> {
        self.ctx
            .platform()
            .and_then(|p| p.listener_id_ranges(self.name(), message_type))
    }
}

impl PipelineEventProducer for PluginEntry {
    fn recycle(&self, event: &Event) {
        if let Some(source) = self.peek_instance().as_deref().and_then(Plugin::as_event_source) {
            source.recycle(event);
        }
    }

    fn pause_dispatch(&self, processor: &str) {
        if let Some(source) = self.peek_instance().as_deref().and_then(Plugin::as_event_source) {
            source.pause_dispatch(processor);
        }
    }
}

impl std::fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEntry")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("holds_instance", &self.holds_instance())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DirectoryType, PlatformError};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    struct StubPlugin {
        loaded: AtomicBool,
        unloaded: AtomicBool,
        handled: AtomicUsize,
    }

    impl StubPlugin {
        fn new() -> Arc<Self> {
            Arc::new(StubPlugin {
                loaded: AtomicBool::new(false),
                unloaded: AtomicBool::new(false),
                handled: AtomicUsize::new(0),
            })
        }
    }

    impl Plugin for StubPlugin {
        fn version(&self) -> &str {
            "9.9.9"
        }
        fn on_load(&self) {
            self.loaded.store(true, Ordering::SeqCst);
        }
        fn on_unload(&self) {
            self.unloaded.store(true, Ordering::SeqCst);
        }
        fn on_event(&self, event: &mut Event) -> bool {
            self.handled.fetch_add(1, Ordering::SeqCst);
            event.set_value("handled_by", "stub");
            true
        }
    }

    /// Platform double that only knows how to instantiate one proxy.
    struct StubPlatform {
        built: AtomicUsize,
        canned: Mutex<Option<Arc<dyn Plugin>>>,
    }

    impl StubPlatform {
        fn with_canned(instance: Arc<dyn Plugin>) -> Arc<Self> {
            Arc::new(StubPlatform {
                built: AtomicUsize::new(0),
                canned: Mutex::new(Some(instance)),
            })
        }
    }

    impl PlatformContext for StubPlatform {
        fn is_ready(&self) -> bool {
            true
        }
        fn shared_work_loop(&self) -> Arc<EventLoop> {
            unreachable!("not used by entry tests")
        }
        fn post_unordered_event(&self, _event: Event) {}
        fn register_unordered_event_listener(&self, _listener: &Arc<dyn EventListener>) {}
        fn add_listener_id_interest(
            &self,
            _name: &str,
            _message_type: MessageType,
            _ranges: &[EventIdRange],
        ) {
        }
        fn add_listener_name_interest(
            &self,
            _name: &str,
            _message_type: MessageType,
            _needles: &[String],
        ) {
        }
        fn listener_id_ranges(
            &self,
            _name: &str,
            _message_type: MessageType,
        ) -> Option<Vec<EventIdRange>> {
            None
        }
        fn post_sync_event_to_target(
            &self,
            _callee: &str,
            _event: Event,
        ) -> Result<bool, PlatformError> {
            Ok(false)
        }
        fn post_async_event_to_target(
            &self,
            _callee: &str,
            _event: Event,
        ) -> Result<(), PlatformError> {
            Ok(())
        }
        fn post_event_to_remote(&self, _event: Event) -> Result<(), PlatformError> {
            Ok(())
        }
        fn publish_plugin_capacity(&self, _capacities: &[String]) -> Result<(), PlatformError> {
            Ok(())
        }
        fn remote_plugin_capacity(&self, _device: &str) -> Vec<String> {
            Vec::new()
        }
        fn request_unload_plugin(&self, _name: &str) {}
        fn get_plugin(&self, _name: &str) -> Option<Arc<PluginEntry>> {
            None
        }
        fn pipeline_sequence(&self, _pipeline: &str) -> Option<Vec<Weak<PluginEntry>>> {
            None
        }
        fn instance_plugin_by_proxy(&self, name: &str) -> Result<Arc<dyn Plugin>, PlatformError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            self.canned
                .lock()
                .unwrap()
                .take()
                .ok_or(PlatformError::FactoryMissing { name: name.to_string() })
        }
        fn append_plugin_to_pipeline(
            &self,
            _plugin: &str,
            _pipeline: &str,
        ) -> Result<(), PlatformError> {
            Ok(())
        }
        fn request_load_bundle(&self, _name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
        fn request_unload_bundle(&self, _name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
        fn directory(&self, _kind: DirectoryType) -> PathBuf {
            PathBuf::new()
        }
        fn property(&self, _key: &str, default: &str) -> String {
            default.to_string()
        }
        fn set_property(&self, _key: &str, _value: &str) {}
    }

    fn idle_loop() -> Arc<EventLoop> {
        Arc::new(EventLoop::new("entry_tests"))
    }

    fn entry_with(
        platform: &Arc<StubPlatform>,
        kind: PluginKind,
    ) -> Arc<PluginEntry> {
        let platform: Arc<dyn PlatformContext> = platform.clone();
        PluginEntry::build(
            "stub_plugin",
            Arc::downgrade(&platform),
            idle_loop(),
            kind,
            None,
            Vec::new(),
        )
    }

    #[test]
    fn resident_entry_dispatches_to_its_instance() {
        let stub = StubPlugin::new();
        let platform = StubPlatform::with_canned(stub.clone());
        let entry = entry_with(&platform, PluginKind::Static);
        entry.install_instance(stub.clone());

        assert!(entry.holds_instance());
        assert_eq!(entry.version(), "9.9.9");

        let mut event = Event::new("t", MessageType::Raw, 1);
        assert!(entry.on_event(&mut event));
        assert_eq!(event.value("handled_by"), "stub");
        assert_eq!(stub.handled.load(Ordering::SeqCst), 1);
        assert_eq!(entry.in_flight(), 0);
    }

    #[test]
    fn proxy_builds_its_instance_on_first_use_only() {
        let stub = StubPlugin::new();
        let platform = StubPlatform::with_canned(stub.clone());
        let entry = entry_with(&platform, PluginKind::Proxy);

        assert!(!entry.holds_instance());
        let mut event = Event::new("t", MessageType::Raw, 1);
        assert!(entry.on_event(&mut event));
        assert!(entry.holds_instance());
        assert!(entry.on_event(&mut event));
        // Second dispatch reuses the cached instance.
        assert_eq!(platform.built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_proxy_instance_is_evicted_and_unloaded() {
        let stub = StubPlugin::new();
        let platform = StubPlatform::with_canned(stub.clone());
        let entry = entry_with(&platform, PluginKind::Proxy);

        let mut event = Event::new("t", MessageType::Raw, 1);
        assert!(entry.on_event(&mut event));
        assert!(entry.holds_instance());

        // Not idle long enough yet.
        assert!(!entry.destroy_instance_if_idle(Duration::from_secs(60)));
        assert!(entry.holds_instance());

        thread::sleep(Duration::from_millis(30));
        assert!(entry.destroy_instance_if_idle(Duration::from_millis(20)));
        assert!(!entry.holds_instance());
        assert!(stub.unloaded.load(Ordering::SeqCst));

        // Nothing left to evict.
        assert!(!entry.destroy_instance_if_idle(Duration::from_millis(0)));
    }

    #[test]
    fn resident_entries_are_never_evicted() {
        let stub = StubPlugin::new();
        let platform = StubPlatform::with_canned(stub.clone());
        let entry = entry_with(&platform, PluginKind::Static);
        entry.install_instance(stub);
        thread::sleep(Duration::from_millis(10));
        assert!(!entry.destroy_instance_if_idle(Duration::from_millis(1)));
        assert!(entry.holds_instance());
    }

    #[test]
    fn failed_proxy_instantiation_reports_unhandled() {
        let platform = Arc::new(StubPlatform {
            built: AtomicUsize::new(0),
            canned: Mutex::new(None),
        });
        let entry = entry_with(&platform, PluginKind::Proxy);

        let mut event = Event::new("t", MessageType::Raw, 1);
        assert!(!entry.on_event(&mut event));
        assert!(!entry.holds_instance());
    }
}
