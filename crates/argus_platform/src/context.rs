//! The platform surface plugins program against, and the error
//! taxonomy for operations that can fail.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use thiserror::Error;

use argus_event_system::{Event, EventIdRange, EventListener, EventLoop, MessageType};

use crate::plugin::{Plugin, PluginEntry};

/// Well-known directories resolved by the platform at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryType {
    /// Plugin and bundle configuration.
    Config,
    /// Staging area for configuration pushed at runtime.
    CloudUpdate,
    /// Scratch space for plugin work files.
    Work,
    /// Durable plugin state.
    Persist,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform is not ready")]
    NotReady,

    #[error("unknown target plugin `{name}`")]
    UnknownTarget { name: String },

    #[error("unknown pipeline `{name}`")]
    UnknownPipeline { name: String },

    #[error("plugin reference for `{name}` has expired")]
    ExpiredReference { name: String },

    #[error("failed to parse configuration `{path}`: {reason}")]
    ConfigParse { path: String, reason: String },

    #[error("no factory registered for plugin `{name}`")]
    FactoryMissing { name: String },

    #[error("plugin `{name}` vetoed loading")]
    LoadVetoed { name: String },

    #[error("bundle `{name}` failed to load: {reason}")]
    BundleLoad { name: String, reason: String },

    #[error("another platform instance appears to be running (pid file `{path}`)")]
    AlreadyRunning { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything a hosted plugin may ask of its platform.
///
/// Handed to plugins as a weak reference inside their
/// [`crate::plugin::PluginContext`]; operations that need a live
/// platform fail soft once it is gone.
pub trait PlatformContext: Send + Sync {
    /// `true` once startup loading finished. Events posted before that
    /// are dropped with a log.
    fn is_ready(&self) -> bool;

    /// The loop shared by plugins without a private work thread.
    fn shared_work_loop(&self) -> Arc<EventLoop>;

    /// Queues an event for broadcast to interested listeners. The
    /// event is tagged unordered and given a root trace if it lacks
    /// one.
    fn post_unordered_event(&self, event: Event);

    /// Binds a live listener to its interest record.
    fn register_unordered_event_listener(&self, listener: &Arc<dyn EventListener>);

    /// Declares id-interval interest for a named listener or plugin.
    fn add_listener_id_interest(
        &self,
        name: &str,
        message_type: MessageType,
        ranges: &[EventIdRange],
    );

    /// Declares `domain_eventName` fragment interest for a named
    /// listener or plugin.
    fn add_listener_name_interest(&self, name: &str, message_type: MessageType, needles: &[String]);

    /// Reads back the id intervals recorded for `name`.
    fn listener_id_ranges(&self, name: &str, message_type: MessageType)
        -> Option<Vec<EventIdRange>>;

    /// Dispatches `event` on the callee's work loop and blocks for its
    /// verdict. Deadlocks if called from the callee's own loop thread;
    /// the platform dispatches inline in that case.
    fn post_sync_event_to_target(&self, callee: &str, event: Event)
        -> Result<bool, PlatformError>;

    /// Dispatches `event` on the callee's work loop without waiting.
    fn post_async_event_to_target(&self, callee: &str, event: Event)
        -> Result<(), PlatformError>;

    /// Hands an event to the distributed communicator plugin, when one
    /// is hosted.
    fn post_event_to_remote(&self, event: Event) -> Result<(), PlatformError>;

    /// Announces local plugin capacities to remote peers through the
    /// communicator plugin.
    fn publish_plugin_capacity(&self, capacities: &[String]) -> Result<(), PlatformError>;

    /// Capacities last reported by a remote device.
    fn remote_plugin_capacity(&self, device: &str) -> Vec<String>;

    /// Schedules an unload attempt for `name`. Retries while the
    /// plugin is busy or externally referenced.
    fn request_unload_plugin(&self, name: &str);

    fn get_plugin(&self, name: &str) -> Option<Arc<PluginEntry>>;

    /// Current processor sequence of a pipeline; `None` when no such
    /// pipeline exists.
    fn pipeline_sequence(&self, pipeline: &str) -> Option<Vec<Weak<PluginEntry>>>;

    /// Builds the real instance behind a proxy entry. Called by the
    /// entry itself under its instance lock; the returned instance has
    /// been through `on_load` and event source attachment.
    fn instance_plugin_by_proxy(&self, name: &str) -> Result<Arc<dyn Plugin>, PlatformError>;

    /// Appends a hosted plugin to the end of an existing pipeline.
    fn append_plugin_to_pipeline(&self, plugin: &str, pipeline: &str)
        -> Result<(), PlatformError>;

    /// Loads `<name>.bundle.toml` from the config directory along with
    /// its shared library.
    fn request_load_bundle(&self, name: &str) -> Result<(), PlatformError>;

    /// Unloads a previously loaded bundle after unloading its plugins.
    fn request_unload_bundle(&self, name: &str) -> Result<(), PlatformError>;

    fn directory(&self, kind: DirectoryType) -> PathBuf;

    /// Platform property with environment fallback: a key absent from
    /// the property table is looked up as an environment variable
    /// before the default applies.
    fn property(&self, key: &str, default: &str) -> String;

    fn set_property(&self, key: &str, value: &str);
}
