//! Platform and bundle configuration, TOML-backed.
//!
//! Configuration mistakes fall into two classes: a file that does not
//! parse is fatal at startup, while semantically odd entries (duplicate
//! names, unknown handler types) are logged and skipped so one bad
//! plugin cannot take down the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::PlatformError;

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_persist_dir() -> PathBuf {
    PathBuf::from("persist")
}

fn default_cloud_update_dir() -> PathBuf {
    PathBuf::from("cloud_update")
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_check_idle_secs() -> u64 {
    120
}

/// Top-level platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Where bundle descriptors (`<name>.bundle.toml`) are scanned.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_persist_dir")]
    pub persist_dir: PathBuf,
    #[serde(default = "default_cloud_update_dir")]
    pub cloud_update_dir: PathBuf,
    /// Overrides the default `<work_dir>/argus.pid`.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Idle seconds before a proxy instance is destroyed.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    /// Cadence of the idle sweep.
    #[serde(default = "default_check_idle_secs")]
    pub check_idle_secs: u64,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginInfo>,
    #[serde(default, rename = "pipeline")]
    pub pipelines: Vec<PipelineInfo>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            config_dir: default_config_dir(),
            work_dir: default_work_dir(),
            persist_dir: default_persist_dir(),
            cloud_update_dir: default_cloud_update_dir(),
            pid_file: None,
            max_idle_secs: default_max_idle_secs(),
            check_idle_secs: default_check_idle_secs(),
            properties: HashMap::new(),
            plugins: Vec::new(),
            pipelines: Vec::new(),
        }
    }
}

/// One plugin declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    /// Static plugins are compiled into the host.
    #[serde(default, rename = "static")]
    pub is_static: bool,
    /// Declares the plugin an event source for diagnostics; the
    /// attachment itself is decided by the instance.
    #[serde(default)]
    pub event_source: bool,
    /// Seconds to defer creation after startup; 0 loads immediately.
    #[serde(default)]
    pub load_delay_secs: u64,
    /// Work loop binding: "thread" (private loop), "pool" (named
    /// shared loop) or "" (the platform loop).
    #[serde(default)]
    pub work_handler: String,
    #[serde(default)]
    pub work_handler_name: String,
    /// Pipelines handed to this plugin when it is an event source.
    #[serde(default)]
    pub pipelines: Vec<String>,
}

impl PluginInfo {
    pub fn named(name: &str) -> Self {
        PluginInfo {
            name: name.to_string(),
            is_static: false,
            event_source: false,
            load_delay_secs: 0,
            work_handler: String::new(),
            work_handler_name: String::new(),
            pipelines: Vec::new(),
        }
    }

    /// Key of the loop this plugin binds to, `None` for the shared
    /// platform loop. Private threads default to a loop named after
    /// the plugin; pools default to one communal pool loop.
    pub fn loop_key(&self) -> Option<String> {
        match self.work_handler.as_str() {
            "thread" => Some(if self.work_handler_name.is_empty() {
                self.name.clone()
            } else {
                self.work_handler_name.clone()
            }),
            "pool" => Some(if self.work_handler_name.is_empty() {
                "pool".to_string()
            } else {
                self.work_handler_name.clone()
            }),
            _ => None,
        }
    }
}

/// One pipeline declaration: an ordered list of plugin names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub name: String,
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// Descriptor for a dynamically loadable bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    pub bundle: BundleMeta,
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginInfo>,
    #[serde(default, rename = "pipeline")]
    pub pipelines: Vec<PipelineInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub name: String,
    /// Shared library path, absolute or relative to the descriptor.
    pub library: PathBuf,
}

fn parse_error(path: &Path, reason: impl std::fmt::Display) -> PlatformError {
    PlatformError::ConfigParse {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

impl PlatformConfig {
    pub fn from_file(path: &Path) -> Result<Self, PlatformError> {
        let raw = std::fs::read_to_string(path)?;
        let config: PlatformConfig =
            toml::from_str(&raw).map_err(|e| parse_error(path, e))?;
        Ok(config.sanitized())
    }

    /// Drops duplicate declarations and normalizes handler types.
    /// Cross-references (pipeline membership, plugin pipeline lists)
    /// are checked later against the live tables, since bundles add
    /// names this file cannot see.
    pub fn sanitized(mut self) -> Self {
        let mut seen_plugins = Vec::new();
        self.plugins.retain(|plugin| {
            if seen_plugins.contains(&plugin.name) {
                warn!(plugin = %plugin.name, "duplicate plugin declaration skipped");
                return false;
            }
            seen_plugins.push(plugin.name.clone());
            true
        });

        let mut seen_pipelines = Vec::new();
        self.pipelines.retain(|pipeline| {
            if seen_pipelines.contains(&pipeline.name) {
                warn!(pipeline = %pipeline.name, "duplicate pipeline declaration skipped");
                return false;
            }
            seen_pipelines.push(pipeline.name.clone());
            true
        });

        for plugin in &mut self.plugins {
            match plugin.work_handler.as_str() {
                "" | "thread" | "pool" => {}
                other => {
                    warn!(
                        plugin = %plugin.name,
                        work_handler = %other,
                        "unknown work handler type, using the shared loop"
                    );
                    plugin.work_handler.clear();
                    plugin.work_handler_name.clear();
                }
            }
        }
        self
    }

    /// The pid file path, derived from `work_dir` unless overridden.
    pub fn pid_path(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("argus.pid"))
    }
}

impl BundleConfig {
    pub fn from_file(path: &Path) -> Result<Self, PlatformError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BundleConfig =
            toml::from_str(&raw).map_err(|e| parse_error(path, e))?;
        Ok(config)
    }

    /// Library path resolved against the descriptor's directory.
    pub fn library_path(&self, descriptor: &Path) -> PathBuf {
        if self.bundle.library.is_absolute() {
            self.bundle.library.clone()
        } else {
            descriptor
                .parent()
                .map(|dir| dir.join(&self.bundle.library))
                .unwrap_or_else(|| self.bundle.library.clone())
        }
    }
}
