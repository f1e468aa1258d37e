use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Source of plugin-provided imports.
///
/// Plugin discovery lives outside kiln; the script compiler only needs the
/// ordered list of loaded plugins and the symbols each one exports.
pub trait PluginRegistry: Send + Sync {
    fn list_loaded_plugin_ids(&self) -> Vec<String>;
    fn imports_for(&self, plugin_id: &str) -> Vec<String>;

    /// All plugin imports in plugin order, without duplicates.
    fn all_imports(&self) -> Vec<String> {
        let mut imports: Vec<String> = Vec::new();
        for id in self.list_loaded_plugin_ids() {
            for import in self.imports_for(&id) {
                if !imports.contains(&import) {
                    imports.push(import);
                }
            }
        }
        imports
    }
}

type PluginList = Vec<(String, Vec<String>)>;

/// In-memory registry, filled by the embedding application.
///
/// Plugins are listed in load order. Registering a loaded id again replaces
/// its imports and keeps its position.
#[derive(Debug, Default)]
pub struct StaticPluginRegistry {
    plugins: RwLock<PluginList>,
}

impl StaticPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, S>(&self, plugin_id: impl Into<String>, imports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let plugin_id = plugin_id.into();
        let imports: Vec<String> = imports.into_iter().map(Into::into).collect();
        let mut plugins = self.write();
        match plugins.iter_mut().find(|entry| entry.0 == plugin_id) {
            Some((_, existing)) => *existing = imports,
            None => plugins.push((plugin_id, imports)),
        }
    }

    pub fn unregister(&self, plugin_id: &str) {
        self.write().retain(|entry| entry.0 != plugin_id);
    }

    fn read(&self) -> RwLockReadGuard<'_, PluginList> {
        self.plugins.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Plugin registry lock poisoned; using last written state");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, PluginList> {
        self.plugins.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Plugin registry lock poisoned; using last written state");
            poisoned.into_inner()
        })
    }
}

impl PluginRegistry for StaticPluginRegistry {
    fn list_loaded_plugin_ids(&self) -> Vec<String> {
        self.read().iter().map(|(id, _)| id.clone()).collect()
    }

    fn imports_for(&self, plugin_id: &str) -> Vec<String> {
        self.read()
            .iter()
            .find(|entry| entry.0 == plugin_id)
            .map(|(_, imports)| imports.clone())
            .unwrap_or_default()
    }
}
