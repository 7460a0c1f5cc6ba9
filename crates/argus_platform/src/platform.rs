//! The hosting platform: owns plugins, pipelines, loops, and the
//! broadcast queue, and implements the context surface plugins see.
//!
//! Startup order matters and is fixed: directories, properties, pid
//! guard, infrastructure (queue and shared loop), plugin entries,
//! pipelines, lifecycle activation in declaration order, bundle scan,
//! then the ready flag flips and the load announcement goes out.
//! Configuration that fails to parse aborts startup; a plugin that
//! cannot be created is skipped with a log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use argus_event_system::{
    Event, EventDispatchQueue, EventHandler, EventIdRange, EventListener, EventLoop,
    ListenerRegistry, ManageType, MessageType, TraceInfo,
};

use crate::bundle::LoadedBundle;
use crate::config::{BundleConfig, PipelineInfo, PlatformConfig, PluginInfo};
use crate::context::{DirectoryType, PlatformContext, PlatformError};
use crate::event_source::EventSource;
use crate::pipeline::Pipeline;
use crate::plugin::{Plugin, PluginEntry, PluginKind};
use crate::registry::{
    plugin_factory, registered_factory_names, unregister_bundle_factories,
    unregister_plugin_factory,
};

/// Broadcast after startup loading completes.
pub const PLUGIN_LOADED_EVENT_ID: u32 = 1;
/// Broadcast after a plugin is unloaded at runtime.
pub const PLUGIN_UNLOADED_EVENT_ID: u32 = 2;
/// Carries capacity announcements toward remote peers.
pub const CAPACITY_PUBLISH_EVENT_ID: u32 = 3;

/// Plugin name the remote forwarding stubs delegate to when hosted.
pub const DISTRIBUTED_COMMUNICATOR_PLUGIN: &str = "DistributedCommunicatorPlugin";

const UNLOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exclusive-run guard. The file holds our pid and is removed on drop;
/// a file naming a live process blocks startup.
struct PidFile {
    path: PathBuf,
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    // No cheap liveness probe; treat any recorded pid as live.
    true
}

impl PidFile {
    fn acquire(path: PathBuf) -> Result<PidFile, PlatformError> {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                if process_alive(pid) {
                    return Err(PlatformError::AlreadyRunning {
                        path: path.display().to_string(),
                    });
                }
            }
            warn!(pid_file = %path.display(), "stale pid file replaced");
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(PidFile { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone)]
pub struct PlatformStats {
    pub ready: bool,
    pub plugins: usize,
    pub pipelines: usize,
    pub private_loops: usize,
    pub queue_depth: usize,
    pub listeners: usize,
}

pub struct Platform {
    me: Weak<Platform>,
    config: PlatformConfig,
    directories: HashMap<DirectoryType, PathBuf>,
    properties: DashMap<String, String>,
    plugins: DashMap<String, Arc<PluginEntry>>,
    pipelines: DashMap<String, Arc<Pipeline>>,
    work_loops: DashMap<String, Arc<EventLoop>>,
    shared_loop: Arc<EventLoop>,
    listener_registry: Arc<ListenerRegistry>,
    dispatch_queue: Arc<EventDispatchQueue>,
    ready: AtomicBool,
    stopped: AtomicBool,
    pid_guard: Mutex<Option<PidFile>>,
    // Declared last: libraries must unmap only after every plugin
    // instance above has dropped.
    bundles: Mutex<Vec<LoadedBundle>>,
}

impl Platform {
    /// Brings up a platform from an already parsed configuration.
    pub fn init(config: PlatformConfig) -> Result<Arc<Platform>, PlatformError> {
        let config = config.sanitized();

        let mut directories = HashMap::new();
        for (kind, path) in [
            (DirectoryType::Config, &config.config_dir),
            (DirectoryType::Work, &config.work_dir),
            (DirectoryType::Persist, &config.persist_dir),
            (DirectoryType::CloudUpdate, &config.cloud_update_dir),
        ] {
            std::fs::create_dir_all(path)?;
            directories.insert(kind, path.clone());
        }

        let pid_guard = PidFile::acquire(config.pid_path())?;

        let properties: DashMap<String, String> = config
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let listener_registry = Arc::new(ListenerRegistry::new());
        let shared_loop = Arc::new(EventLoop::new("platform"));
        let dispatch_queue = Arc::new(EventDispatchQueue::new(
            "broadcast",
            listener_registry.clone(),
        ));

        let platform = Arc::new_cyclic(|me: &Weak<Platform>| Platform {
            me: me.clone(),
            config,
            directories,
            properties,
            plugins: DashMap::new(),
            pipelines: DashMap::new(),
            work_loops: DashMap::new(),
            shared_loop,
            listener_registry,
            dispatch_queue,
            ready: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pid_guard: Mutex::new(Some(pid_guard)),
            bundles: Mutex::new(Vec::new()),
        });

        platform.shared_loop.start();
        platform.dispatch_queue.start();

        platform.load_configured_plugins();
        platform.load_configured_pipelines();
        platform.activate_startup_plugins();
        platform.scan_bundle_descriptors();

        platform.ready.store(true, Ordering::SeqCst);
        platform.announce(PLUGIN_LOADED_EVENT_ID, "plugin_loaded");
        platform.schedule_idle_sweep();
        info!(
            plugins = platform.plugins.len(),
            pipelines = platform.pipelines.len(),
            "🚀 platform ready"
        );
        Ok(platform)
    }

    /// Parses `path` and brings up the platform it describes.
    pub fn init_from_file(path: &Path) -> Result<Arc<Platform>, PlatformError> {
        let config = PlatformConfig::from_file(path)?;
        Platform::init(config)
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub(crate) fn listener_registry(&self) -> &Arc<ListenerRegistry> {
        &self.listener_registry
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).map(|p| p.value().clone())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> PlatformStats {
        PlatformStats {
            ready: self.is_ready(),
            plugins: self.plugins.len(),
            pipelines: self.pipelines.len(),
            private_loops: self.work_loops.len(),
            queue_depth: self.dispatch_queue.wait_queue_size(),
            listeners: self.listener_registry.len(),
        }
    }

    /// Multi-line diagnostic snapshot, plugin dumps included.
    pub fn dump(&self, args: &[String]) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let stats = self.stats();
        let _ = writeln!(
            out,
            "platform ready={} plugins={} pipelines={} loops={} queue={}",
            stats.ready, stats.plugins, stats.pipelines, stats.private_loops, stats.queue_depth
        );
        let mut factories = registered_factory_names();
        factories.sort();
        let _ = writeln!(out, "factories {factories:?}");
        let hosted: Vec<Arc<PluginEntry>> =
            self.plugins.iter().map(|e| e.value().clone()).collect();
        for plugin in hosted {
            let _ = writeln!(
                out,
                "plugin {} kind={:?} loop={} instance={} in_flight={} version={}",
                plugin.name(),
                plugin.kind(),
                plugin.work_loop().name(),
                plugin.holds_instance(),
                plugin.in_flight(),
                plugin.version()
            );
            let detail = plugin.dump(args);
            if !detail.is_empty() {
                let _ = writeln!(out, "  {detail}");
            }
        }
        for pipeline in self.pipelines.iter() {
            let _ = writeln!(
                out,
                "pipeline {} -> {:?}",
                pipeline.key(),
                pipeline.value().processor_names()
            );
        }
        out
    }

    /// Stops dispatch, unloads every plugin, and parks all loops.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        info!("🛑 platform shutting down");
        self.dispatch_queue.stop();

        let names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, entry)) = self.plugins.remove(&name) {
                if let Some(instance) = entry.peek_instance() {
                    instance.on_unload();
                }
                debug!(plugin = %name, "plugin unloaded");
            }
        }
        self.pipelines.clear();

        for item in self.work_loops.iter() {
            item.value().stop();
        }
        self.work_loops.clear();
        self.shared_loop.stop();
        *self.pid_guard.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn load_configured_plugins(&self) {
        for info in &self.config.plugins {
            if info.load_delay_secs > 0 {
                self.schedule_delayed_load(info.clone());
                continue;
            }
            self.create_plugin(info, None);
        }
    }

    fn load_configured_pipelines(&self) {
        for info in &self.config.pipelines {
            self.create_pipeline(info);
        }
    }

    fn activate_startup_plugins(&self) {
        for info in &self.config.plugins {
            if info.load_delay_secs > 0 {
                continue;
            }
            // Clone out of the table first; on_load may call back into
            // the platform.
            let entry = self.plugins.get(&info.name).map(|e| e.value().clone());
            if let Some(entry) = entry {
                self.activate_plugin(&entry);
            }
        }
    }

    fn create_plugin(&self, info: &PluginInfo, bundle: Option<&str>) -> Option<Arc<PluginEntry>> {
        if self.plugins.contains_key(&info.name) {
            warn!(plugin = %info.name, "plugin already hosted, declaration skipped");
            return None;
        }
        let Some(factory) = plugin_factory(&info.name) else {
            warn!(plugin = %info.name, "❓ no factory registered, plugin skipped");
            return None;
        };
        let work_loop = self.resolve_work_loop(info);
        let proxied = factory.need_proxy && !factory.need_startup_loading;
        let bundle_name = bundle.map(str::to_string).or_else(|| factory.bundle.clone());
        let kind = if proxied {
            PluginKind::Proxy
        } else if bundle_name.is_some() {
            PluginKind::Dynamic
        } else {
            PluginKind::Static
        };

        let entry = PluginEntry::build(
            &info.name,
            self.me.clone() as Weak<dyn PlatformContext>,
            work_loop,
            kind,
            bundle_name,
            info.pipelines.clone(),
        );
        if kind != PluginKind::Proxy {
            let instance = (factory.ctor)(entry.context().clone());
            if !instance.ready_to_load() {
                info!(plugin = %info.name, "plugin vetoed loading, skipped");
                return None;
            }
            entry.install_instance(instance);
        }
        debug!(plugin = %info.name, ?kind, "🔌 plugin entry created");
        self.plugins.insert(info.name.clone(), entry.clone());
        Some(entry)
    }

    fn create_pipeline(&self, info: &PipelineInfo) {
        if self.pipelines.contains_key(&info.name) {
            warn!(pipeline = %info.name, "pipeline already exists, declaration skipped");
            return;
        }
        let mut processors = Vec::new();
        for plugin_name in &info.plugins {
            match self.plugins.get(plugin_name) {
                Some(entry) => processors.push(Arc::downgrade(entry.value())),
                None => warn!(
                    pipeline = %info.name,
                    plugin = %plugin_name,
                    "pipeline references unknown plugin, slot skipped"
                ),
            }
        }
        debug!(pipeline = %info.name, processors = processors.len(), "pipeline created");
        self.pipelines
            .insert(info.name.clone(), Arc::new(Pipeline::new(info.name.clone(), processors)));
    }

    /// Runs `on_load` and event source attachment for entries holding
    /// an instance. Proxy entries activate when first instantiated.
    fn activate_plugin(&self, entry: &Arc<PluginEntry>) {
        let Some(instance) = entry.peek_instance() else {
            return;
        };
        instance.on_load();
        info!(plugin = %entry.name(), version = %instance.version(), "📝 plugin loaded");
        self.attach_event_source(entry, &instance);
    }

    fn attach_event_source(&self, entry: &Arc<PluginEntry>, instance: &Arc<dyn Plugin>) {
        if instance.as_event_source().is_none() {
            return;
        }
        for pipeline_name in entry.pipeline_names() {
            let pipeline = self.pipelines.get(pipeline_name).map(|p| p.value().clone());
            match pipeline {
                Some(pipeline) => {
                    if let Some(source) = instance.as_event_source() {
                        source.add_pipeline(pipeline);
                    }
                }
                None => warn!(
                    plugin = %entry.name(),
                    pipeline = %pipeline_name,
                    "unknown pipeline, source not attached"
                ),
            }
        }
        // Production starts on the source's own loop, not the loader's
        // thread.
        let starter = instance.clone();
        entry.work_loop().add_task(move || {
            if let Some(source) = starter.as_event_source() {
                source.start_event_source();
            }
        });
        debug!(plugin = %entry.name(), "event source start scheduled");
    }

    fn resolve_work_loop(&self, info: &PluginInfo) -> Arc<EventLoop> {
        match info.loop_key() {
            None => self.shared_loop.clone(),
            Some(key) => self
                .work_loops
                .entry(key.clone())
                .or_insert_with(|| {
                    let work_loop = Arc::new(EventLoop::new(key.as_str()));
                    work_loop.start();
                    work_loop
                })
                .clone(),
        }
    }

    fn schedule_delayed_load(&self, info: PluginInfo) {
        info!(
            plugin = %info.name,
            delay_secs = info.load_delay_secs,
            "plugin load deferred"
        );
        let me = self.me.clone();
        let delay = Duration::from_secs(info.load_delay_secs);
        self.shared_loop.add_timer_task(
            move || {
                let Some(platform) = me.upgrade() else {
                    return;
                };
                info!(plugin = %info.name, "⏰ loading deferred plugin");
                if let Some(entry) = platform.create_plugin(&info, None) {
                    platform.activate_plugin(&entry);
                }
            },
            delay,
            false,
        );
    }

    fn scan_bundle_descriptors(&self) {
        let dir = self.directory(DirectoryType::Config);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "config directory not scannable");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(bundle_name) = file_name.strip_suffix(".bundle.toml") else {
                continue;
            };
            if let Err(err) = self.load_bundle_descriptor(bundle_name, &path) {
                error!(bundle = %bundle_name, error = %err, "bundle skipped");
            }
        }
    }

    fn load_bundle_descriptor(&self, name: &str, descriptor: &Path) -> Result<(), PlatformError> {
        {
            let bundles = self.bundles.lock().unwrap_or_else(|e| e.into_inner());
            if bundles.iter().any(|b| b.name == name) {
                return Err(PlatformError::BundleLoad {
                    name: name.to_string(),
                    reason: "already loaded".to_string(),
                });
            }
        }
        let config = BundleConfig::from_file(descriptor)?;
        if config.bundle.name != name {
            warn!(
                bundle = %name,
                declared = %config.bundle.name,
                "bundle name differs from its descriptor file"
            );
        }
        let library_path = config.library_path(descriptor);
        let loaded = LoadedBundle::load(name, &library_path)?;

        let mut created = Vec::new();
        for info in &config.plugins {
            if let Some(entry) = self.create_plugin(info, Some(name)) {
                created.push(entry);
            }
        }
        for info in &config.pipelines {
            self.create_pipeline(info);
        }
        for entry in &created {
            self.activate_plugin(entry);
        }
        self.bundles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(loaded);
        info!(bundle = %name, plugins = created.len(), "bundle ready");
        Ok(())
    }

    fn announce(&self, event_id: u32, event_name: &str) {
        let event = Event::new("platform", MessageType::PluginMaintenance, event_id)
            .with_name("platform", event_name);
        self.post_unordered_event(event);
    }

    fn schedule_idle_sweep(&self) {
        let me = self.me.clone();
        let max_idle = Duration::from_secs(self.config.max_idle_secs);
        self.shared_loop.add_timer_task(
            move || {
                let Some(platform) = me.upgrade() else {
                    return;
                };
                for entry in platform.plugins.iter() {
                    if entry.value().kind() != PluginKind::Proxy {
                        continue;
                    }
                    // Evict on the plugin's own loop so eviction
                    // serializes with its dispatches.
                    let target = entry.value().clone();
                    let own_loop = target.work_loop().clone();
                    own_loop.add_task(move || {
                        target.destroy_instance_if_idle(max_idle);
                    });
                }
            },
            Duration::from_secs(self.config.check_idle_secs),
            true,
        );
    }

    fn bind_plugin_listener(&self, name: &str) {
        if self.listener_registry.is_bound(name) {
            return;
        }
        if let Some(entry) = self.plugins.get(name) {
            let target = Arc::downgrade(entry.value()) as Weak<dyn EventListener>;
            self.listener_registry.bind(name, target, true);
        }
    }

    fn schedule_unload(&self, name: String) {
        let me = self.me.clone();
        self.shared_loop.add_timer_task(
            move || {
                let Some(platform) = me.upgrade() else {
                    return;
                };
                platform.try_unload(&name);
            },
            UNLOAD_RETRY_DELAY,
            false,
        );
    }

    fn try_unload(&self, name: &str) {
        let Some(entry) = self.plugins.get(name).map(|e| e.value().clone()) else {
            debug!(plugin = %name, "already unloaded");
            return;
        };
        if entry.kind() == PluginKind::Static {
            warn!(plugin = %name, "static plugins cannot be unloaded");
            return;
        }
        // Expected strong refs: the plugin table and this probe. More
        // means someone is still using the entry; scheduled dispatches
        // also hold one while queued.
        if Arc::strong_count(&entry) > 2 || entry.in_flight() > 0 {
            warn!(
                plugin = %name,
                strong = Arc::strong_count(&entry),
                in_flight = entry.in_flight(),
                "⏳ plugin busy, unload retried"
            );
            self.schedule_unload(name.to_string());
            return;
        }
        self.plugins.remove(name);
        self.listener_registry.remove(name);
        for pipeline in self.pipelines.iter() {
            pipeline.value().remove_processor(&entry);
        }
        if let Some(instance) = entry.peek_instance() {
            instance.on_unload();
        }
        self.release_private_loop(&entry);
        if entry.kind() == PluginKind::Dynamic {
            unregister_plugin_factory(name);
        }
        drop(entry);
        info!(plugin = %name, "plugin unloaded");
        self.announce(PLUGIN_UNLOADED_EVENT_ID, "plugin_unloaded");
    }

    fn release_private_loop(&self, entry: &Arc<PluginEntry>) {
        let work_loop = entry.work_loop();
        if Arc::ptr_eq(work_loop, &self.shared_loop) {
            return;
        }
        let key = self
            .work_loops
            .iter()
            .find(|item| Arc::ptr_eq(item.value(), work_loop))
            .map(|item| item.key().clone());
        let Some(key) = key else {
            return;
        };
        // Loop table plus the departing entry's context are the last
        // expected holders.
        if Arc::strong_count(work_loop) <= 2 {
            if let Some((_, removed)) = self.work_loops.remove(&key) {
                removed.stop();
                debug!(loop_name = %key, "private loop stopped");
            }
        }
    }

    fn try_release_bundle(&self, name: &str) {
        let plugin_names = {
            let bundles = self.bundles.lock().unwrap_or_else(|e| e.into_inner());
            match bundles.iter().find(|b| b.name == name) {
                Some(bundle) => bundle.plugin_names.clone(),
                None => return,
            }
        };
        if plugin_names.iter().any(|p| self.plugins.contains_key(p)) {
            let me = self.me.clone();
            let name = name.to_string();
            self.shared_loop.add_timer_task(
                move || {
                    let Some(platform) = me.upgrade() else {
                        return;
                    };
                    platform.try_release_bundle(&name);
                },
                UNLOAD_RETRY_DELAY,
                false,
            );
            return;
        }
        unregister_bundle_factories(name);
        let mut bundles = self.bundles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(position) = bundles.iter().position(|b| b.name == name) {
            bundles.remove(position);
            info!(bundle = %name, "bundle unloaded");
        }
    }
}

impl PlatformContext for Platform {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    fn shared_work_loop(&self) -> Arc<EventLoop> {
        self.shared_loop.clone()
    }

    fn post_unordered_event(&self, mut event: Event) {
        if !self.is_ready() {
            debug!(
                event_id = event.event_id(),
                "event dropped, platform not ready"
            );
            return;
        }
        event.set_manage_type(ManageType::Unordered);
        if event.trace().is_empty() {
            event.set_trace(TraceInfo::new_root());
        }
        self.dispatch_queue.enqueue(event);
    }

    fn register_unordered_event_listener(&self, listener: &Arc<dyn EventListener>) {
        self.listener_registry.register(listener, false);
    }

    fn add_listener_id_interest(
        &self,
        name: &str,
        message_type: MessageType,
        ranges: &[EventIdRange],
    ) {
        self.listener_registry.add_id_interest(name, message_type, ranges);
        self.bind_plugin_listener(name);
    }

    fn add_listener_name_interest(
        &self,
        name: &str,
        message_type: MessageType,
        needles: &[String],
    ) {
        self.listener_registry.add_name_interest(name, message_type, needles);
        self.bind_plugin_listener(name);
    }

    fn listener_id_ranges(
        &self,
        name: &str,
        message_type: MessageType,
    ) -> Option<Vec<EventIdRange>> {
        self.listener_registry.id_ranges(name, message_type)
    }

    fn post_sync_event_to_target(
        &self,
        callee: &str,
        event: Event,
    ) -> Result<bool, PlatformError> {
        if !self.is_ready() {
            return Err(PlatformError::NotReady);
        }
        let entry = self
            .plugins
            .get(callee)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlatformError::UnknownTarget { name: callee.to_string() })?;
        let handler: Arc<dyn EventHandler> = entry.clone();
        let work_loop = entry.work_loop().clone();
        if work_loop.is_loop_thread() {
            // Waiting on our own loop would deadlock; dispatch inline.
            let mut event = event;
            return Ok(handler.on_event(&mut event));
        }
        Ok(work_loop
            .add_event_for_result(Some(handler), Some(event))
            .wait())
    }

    fn post_async_event_to_target(&self, callee: &str, event: Event) -> Result<(), PlatformError> {
        if !self.is_ready() {
            return Err(PlatformError::NotReady);
        }
        let entry = self
            .plugins
            .get(callee)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlatformError::UnknownTarget { name: callee.to_string() })?;
        let handler: Arc<dyn EventHandler> = entry.clone();
        entry.work_loop().add_event(Some(handler), Some(event));
        Ok(())
    }

    fn post_event_to_remote(&self, event: Event) -> Result<(), PlatformError> {
        if self.plugins.contains_key(DISTRIBUTED_COMMUNICATOR_PLUGIN) {
            return self.post_async_event_to_target(DISTRIBUTED_COMMUNICATOR_PLUGIN, event);
        }
        debug!("no communicator plugin hosted, remote event dropped");
        Ok(())
    }

    fn publish_plugin_capacity(&self, capacities: &[String]) -> Result<(), PlatformError> {
        let mut event = Event::new(
            "platform",
            MessageType::CrossPlatform,
            CAPACITY_PUBLISH_EVENT_ID,
        )
        .with_name("platform", "plugin_capacity");
        event.set_value("capacities", capacities.join(";"));
        self.post_event_to_remote(event)
    }

    fn remote_plugin_capacity(&self, device: &str) -> Vec<String> {
        // Maintained by the communicator plugin as peers report in.
        let raw = self.property(&format!("remote.capacity.{device}"), "");
        if raw.is_empty() {
            Vec::new()
        } else {
            raw.split(';').map(str::to_string).collect()
        }
    }

    fn request_unload_plugin(&self, name: &str) {
        info!(plugin = %name, "plugin unload requested");
        self.schedule_unload(name.to_string());
    }

    fn get_plugin(&self, name: &str) -> Option<Arc<PluginEntry>> {
        self.plugins.get(name).map(|e| e.value().clone())
    }

    fn pipeline_sequence(&self, pipeline: &str) -> Option<Vec<Weak<PluginEntry>>> {
        self.pipelines.get(pipeline).map(|p| p.value().sequence())
    }

    fn instance_plugin_by_proxy(&self, name: &str) -> Result<Arc<dyn Plugin>, PlatformError> {
        let factory = plugin_factory(name)
            .ok_or_else(|| PlatformError::FactoryMissing { name: name.to_string() })?;
        let entry = self
            .plugins
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlatformError::UnknownTarget { name: name.to_string() })?;
        let instance = (factory.ctor)(entry.context().clone());
        if !instance.ready_to_load() {
            return Err(PlatformError::LoadVetoed { name: name.to_string() });
        }
        instance.on_load();
        info!(plugin = %name, "📝 plugin loaded (by proxy)");
        self.attach_event_source(&entry, &instance);
        Ok(instance)
    }

    fn append_plugin_to_pipeline(
        &self,
        plugin: &str,
        pipeline: &str,
    ) -> Result<(), PlatformError> {
        let entry = self
            .plugins
            .get(plugin)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlatformError::UnknownTarget { name: plugin.to_string() })?;
        let pipeline_arc = self
            .pipelines
            .get(pipeline)
            .map(|p| p.value().clone())
            .ok_or_else(|| PlatformError::UnknownPipeline { name: pipeline.to_string() })?;
        pipeline_arc.append_processor(&entry);
        Ok(())
    }

    fn request_load_bundle(&self, name: &str) -> Result<(), PlatformError> {
        let descriptor = self
            .directory(DirectoryType::Config)
            .join(format!("{name}.bundle.toml"));
        if !descriptor.is_file() {
            return Err(PlatformError::BundleLoad {
                name: name.to_string(),
                reason: format!("descriptor {} not found", descriptor.display()),
            });
        }
        self.load_bundle_descriptor(name, &descriptor)
    }

    fn request_unload_bundle(&self, name: &str) -> Result<(), PlatformError> {
        let plugin_names = {
            let bundles = self.bundles.lock().unwrap_or_else(|e| e.into_inner());
            bundles
                .iter()
                .find(|b| b.name == name)
                .map(|b| b.plugin_names.clone())
                .ok_or_else(|| PlatformError::BundleLoad {
                    name: name.to_string(),
                    reason: "not loaded".to_string(),
                })?
        };
        info!(bundle = %name, plugins = plugin_names.len(), "bundle unload requested");
        for plugin in &plugin_names {
            if self.plugins.contains_key(plugin) {
                self.request_unload_plugin(plugin);
            }
        }
        let me = self.me.clone();
        let name = name.to_string();
        self.shared_loop.add_timer_task(
            move || {
                let Some(platform) = me.upgrade() else {
                    return;
                };
                platform.try_release_bundle(&name);
            },
            UNLOAD_RETRY_DELAY * 2,
            false,
        );
        Ok(())
    }

    fn directory(&self, kind: DirectoryType) -> PathBuf {
        self.directories.get(&kind).cloned().unwrap_or_default()
    }

    fn property(&self, key: &str, default: &str) -> String {
        if let Some(value) = self.properties.get(key) {
            return value.clone();
        }
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    }

    fn set_property(&self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shutdown();
    }
}
