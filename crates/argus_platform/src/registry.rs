//! Process-wide plugin factory registry.
//!
//! The one intentionally global table in the platform: hosts register
//! built-in factories before `Platform::init`, and bundle loading
//! registers factories for the plugins a shared library exports.
//! Everything else flows through explicit contexts.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::plugin::PluginCtor;

/// Registered constructor plus loading policy for one plugin name.
#[derive(Clone)]
pub struct PluginFactory {
    pub ctor: PluginCtor,
    /// Wrap the plugin in a lazily instantiated proxy entry.
    pub need_proxy: bool,
    /// Instantiate at startup even when proxying is requested.
    pub need_startup_loading: bool,
    /// Bundle that brought this factory, `None` for built-ins.
    pub bundle: Option<String>,
}

impl PluginFactory {
    pub fn resident(ctor: PluginCtor) -> Self {
        PluginFactory { ctor, need_proxy: false, need_startup_loading: true, bundle: None }
    }

    pub fn proxied(ctor: PluginCtor) -> Self {
        PluginFactory { ctor, need_proxy: true, need_startup_loading: false, bundle: None }
    }
}

static FACTORIES: Lazy<DashMap<String, PluginFactory>> = Lazy::new(DashMap::new);

/// Registers `factory` under `name`, replacing any previous
/// registration with a log.
pub fn register_plugin_factory(name: &str, factory: PluginFactory) {
    if FACTORIES.insert(name.to_string(), factory).is_some() {
        warn!(plugin = %name, "plugin factory replaced");
    } else {
        debug!(plugin = %name, "plugin factory registered");
    }
}

pub fn plugin_factory(name: &str) -> Option<PluginFactory> {
    FACTORIES.get(name).map(|f| f.clone())
}

pub fn unregister_plugin_factory(name: &str) -> bool {
    FACTORIES.remove(name).is_some()
}

/// Removes every factory a bundle registered. Returns how many were
/// dropped.
pub fn unregister_bundle_factories(bundle: &str) -> usize {
    let names: Vec<String> = FACTORIES
        .iter()
        .filter(|entry| entry.value().bundle.as_deref() == Some(bundle))
        .map(|entry| entry.key().clone())
        .collect();
    for name in &names {
        FACTORIES.remove(name);
    }
    names.len()
}

pub fn registered_factory_names() -> Vec<String> {
    FACTORIES.iter().map(|entry| entry.key().clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginContext};
    use argus_event_system::Event;
    use std::sync::Arc;

    struct NullPlugin;
    impl Plugin for NullPlugin {
        fn on_event(&self, _event: &mut Event) -> bool {
            true
        }
    }

    fn null_ctor(_ctx: PluginContext) -> Arc<dyn Plugin> {
        Arc::new(NullPlugin)
    }

    #[test]
    fn register_lookup_unregister_cycle() {
        register_plugin_factory("registry_test_cycle", PluginFactory::resident(null_ctor));
        let factory = plugin_factory("registry_test_cycle").unwrap();
        assert!(!factory.need_proxy);
        assert!(factory.bundle.is_none());

        assert!(unregister_plugin_factory("registry_test_cycle"));
        assert!(plugin_factory("registry_test_cycle").is_none());
        assert!(!unregister_plugin_factory("registry_test_cycle"));
    }

    #[test]
    fn bundle_factories_unregister_as_a_unit() {
        let mut tagged = PluginFactory::proxied(null_ctor);
        tagged.bundle = Some("registry_test_bundle".into());
        register_plugin_factory("registry_test_a", tagged.clone());
        register_plugin_factory("registry_test_b", tagged);
        register_plugin_factory("registry_test_keep", PluginFactory::resident(null_ctor));

        assert_eq!(unregister_bundle_factories("registry_test_bundle"), 2);
        assert!(plugin_factory("registry_test_a").is_none());
        assert!(plugin_factory("registry_test_keep").is_some());
        unregister_plugin_factory("registry_test_keep");
    }
}
