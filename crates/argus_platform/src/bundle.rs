//! Dynamic plugin bundles: shared libraries exporting plugin
//! factories.
//!
//! A bundle library exports one C symbol, `argus_bundle_entry`,
//! producing a heap-allocated [`BundleManifest`] the loader takes
//! ownership of. Plugin construction stays in safe Rust through plain
//! factory function pointers; the unsafe surface is confined to
//! loading the library and calling the entry symbol. Bundles must be
//! built by the same compiler as the host, which the
//! [`crate::declare_plugin_bundle`] macro makes easy to honor.

use std::path::Path;

use libloading::{Library, Symbol};
use tracing::info;

use crate::context::PlatformError;
use crate::plugin::PluginCtor;
use crate::registry::{register_plugin_factory, PluginFactory};

/// Exported symbol name every bundle library must provide.
pub const BUNDLE_ENTRY_SYMBOL: &[u8] = b"argus_bundle_entry";

/// Signature of the exported entry function.
pub type BundleEntryFn = unsafe extern "C" fn() -> *mut BundleManifest;

/// One factory exported by a bundle.
pub struct BundleFactoryRecord {
    pub name: String,
    pub ctor: PluginCtor,
    pub need_proxy: bool,
    pub need_startup_loading: bool,
}

/// Everything a bundle exports, returned by its entry function.
pub struct BundleManifest {
    pub plugins: Vec<BundleFactoryRecord>,
}

/// A loaded bundle. Dropping this drops the library mapping, so it
/// must outlive every plugin instance the bundle produced.
#[derive(Debug)]
pub(crate) struct LoadedBundle {
    pub(crate) name: String,
    pub(crate) plugin_names: Vec<String>,
    _library: Library,
}

impl LoadedBundle {
    pub(crate) fn load(name: &str, path: &Path) -> Result<LoadedBundle, PlatformError> {
        let fail = |reason: String| PlatformError::BundleLoad {
            name: name.to_string(),
            reason,
        };

        // Loading runs arbitrary library initializers; the entry call
        // relies on the symbol honoring BundleEntryFn's contract.
        let library = unsafe { Library::new(path) }.map_err(|e| fail(e.to_string()))?;
        let manifest = unsafe {
            let entry: Symbol<BundleEntryFn> = library
                .get(BUNDLE_ENTRY_SYMBOL)
                .map_err(|e| fail(e.to_string()))?;
            let raw = entry();
            if raw.is_null() {
                return Err(fail("entry function returned null".to_string()));
            }
            Box::from_raw(raw)
        };

        let mut plugin_names = Vec::with_capacity(manifest.plugins.len());
        for record in manifest.plugins {
            register_plugin_factory(
                &record.name,
                PluginFactory {
                    ctor: record.ctor,
                    need_proxy: record.need_proxy,
                    need_startup_loading: record.need_startup_loading,
                    bundle: Some(name.to_string()),
                },
            );
            plugin_names.push(record.name);
        }
        info!(
            bundle = %name,
            plugins = plugin_names.len(),
            "📦 bundle library loaded"
        );
        Ok(LoadedBundle {
            name: name.to_string(),
            plugin_names,
            _library: library,
        })
    }
}

/// Declares the entry point of a plugin bundle library.
///
/// ```ignore
/// argus_platform::declare_plugin_bundle! {
///     "heartbeat_source" => new_heartbeat_source, proxy = false, startup = true;
///     "heartbeat_sink" => new_heartbeat_sink, proxy = true, startup = false;
/// }
/// ```
///
/// Each arm names a plugin and a `fn(PluginContext) -> Arc<dyn Plugin>`
/// factory, plus the proxy/startup loading policy for its entry.
#[macro_export]
macro_rules! declare_plugin_bundle {
    ( $( $name:expr => $ctor:path, proxy = $proxy:expr, startup = $startup:expr );+ $(;)? ) => {
        #[no_mangle]
        pub extern "C" fn argus_bundle_entry() -> *mut $crate::bundle::BundleManifest {
            let manifest = $crate::bundle::BundleManifest {
                plugins: vec![
                    $(
                        $crate::bundle::BundleFactoryRecord {
                            name: $name.to_string(),
                            ctor: $ctor,
                            need_proxy: $proxy,
                            need_startup_loading: $startup,
                        }
                    ),+
                ],
            };
            Box::into_raw(Box::new(manifest))
        }
    };
}
