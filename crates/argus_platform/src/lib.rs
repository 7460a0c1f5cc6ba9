//! Plugin-hosting platform for the Argus diagnostic services.
//!
//! The platform wires the event loops, broadcast queue, and pipelines
//! of [`argus_event_system`] into a hosting shell: plugins are declared
//! in configuration, constructed through registered factories, bound to
//! work loops, and reached by name for sync or async posting. Bundles
//! add plugins from shared libraries at runtime via
//! [`declare_plugin_bundle!`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use argus_platform::events::{Event, MessageType};
//! use argus_platform::{
//!     register_plugin_factory, Platform, PlatformConfig, PlatformContext, Plugin,
//!     PluginContext, PluginFactory, PluginInfo,
//! };
//!
//! struct Probe;
//!
//! impl Plugin for Probe {
//!     fn on_event(&self, event: &mut Event) -> bool {
//!         event.set_value("Probe", "seen");
//!         true
//!     }
//! }
//!
//! fn probe_ctor(_ctx: PluginContext) -> Arc<dyn Plugin> {
//!     Arc::new(Probe)
//! }
//!
//! register_plugin_factory("Probe", PluginFactory::resident(probe_ctor));
//! let mut config = PlatformConfig::default();
//! config.plugins.push(PluginInfo::named("Probe"));
//! let platform = Platform::init(config)?;
//! let handled =
//!     platform.post_sync_event_to_target("Probe", Event::new("host", MessageType::Fault, 1))?;
//! assert!(handled);
//! # Ok::<(), argus_platform::PlatformError>(())
//! ```

pub mod bundle;
pub mod config;
pub mod context;
pub mod event_source;
pub mod pipeline;
pub mod plugin;
pub mod platform;
pub mod registry;


pub use bundle::{BundleFactoryRecord, BundleManifest, BUNDLE_ENTRY_SYMBOL};
pub use config::{BundleConfig, BundleMeta, PipelineInfo, PlatformConfig, PluginInfo};
pub use context::{DirectoryType, PlatformContext, PlatformError};
pub use event_source::EventSource;
pub use pipeline::{fill_pipeline_info, repack_pipeline_event, Pipeline};
pub use plugin::{Plugin, PluginContext, PluginCtor, PluginEntry, PluginKind};
pub use platform::{
    Platform, PlatformStats, CAPACITY_PUBLISH_EVENT_ID, DISTRIBUTED_COMMUNICATOR_PLUGIN,
    PLUGIN_LOADED_EVENT_ID, PLUGIN_UNLOADED_EVENT_ID,
};
pub use registry::{
    plugin_factory, register_plugin_factory, registered_factory_names,
    unregister_bundle_factories, unregister_plugin_factory, PluginFactory,
};

/// The event system, re-exported so plugin crates track one version.
pub use argus_event_system as events;
