use std::{collections::HashMap, fmt, sync::Arc};

use plinth_plugin_sdk::Plugin;

pub type PluginFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// Static binding from plugin id to the factory that builds its runtime half.
///
/// Discovery only locates manifests; a plugin is loadable once its directory
/// id is registered here.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.factories.insert(id.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(plugin = %id, "plugin factory registered twice; keeping the latest");
        }
        self
    }

    /// Registers a plugin type constructible through `Default`.
    pub fn register_default<P>(&mut self, id: impl Into<String>) -> &mut Self
    where
        P: Plugin + Default,
    {
        self.register(id, || Ok(Box::new(P::default()) as Box<dyn Plugin>))
    }

    pub fn get(&self, id: &str) -> Option<&PluginFactory> {
        self.factories.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("PluginRegistry").field("ids", &ids).finish()
    }
}
