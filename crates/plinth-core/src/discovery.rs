use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use plinth_plugin_sdk::{PluginManifest, PluginTag};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Plugins;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("plugin '{plugin}': entry artifact not found at {}", path.display())]
    EntryMissing { plugin: String, path: PathBuf },

    #[error("plugin '{plugin}': manifest not found at {}", path.display())]
    ManifestMissing { plugin: String, path: PathBuf },

    #[error("plugin '{plugin}': failed to read manifest {}: {source}", path.display())]
    ManifestUnreadable {
        plugin: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("plugin '{plugin}': malformed manifest {}: {source}", path.display())]
    ManifestMalformed {
        plugin: String,
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("plugin '{plugin}': manifest is missing required field `{field}`")]
    IncompleteManifest { plugin: String, field: &'static str },
}

/// Admitted manifests keyed by directory id, iterated in discovery order.
#[derive(Debug, Clone, Default)]
pub struct ManifestTable {
    order: Vec<String>,
    entries: HashMap<String, PluginManifest>,
}

impl ManifestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the id was already present; the first entry wins.
    pub fn insert(&mut self, id: impl Into<String>, manifest: PluginManifest) -> bool {
        let id = id.into();
        if self.entries.contains_key(&id) {
            return false;
        }
        self.order.push(id.clone());
        self.entries.insert(id, manifest);
        true
    }

    pub fn get(&self, id: &str) -> Option<&PluginManifest> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PluginManifest)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|manifest| (id.as_str(), manifest)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Outcome of one scan of the plugin root.
#[derive(Debug, Default)]
pub struct Discovery {
    pub manifests: ManifestTable,
    pub tags: Vec<PluginTag>,
    pub rejected: Vec<DiscoveryError>,
}

/// Scans the immediate subdirectories of `root` for plugin manifests.
///
/// Individual plugins that fail validation are logged and recorded in
/// `rejected`; only an unreadable root aborts the scan.
pub fn discover(root: &Path, plugins: &Plugins) -> Result<Discovery> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("failed to read plugin root {}", root.display()))?;
    Ok(scan(
        root,
        entries.map(|entry| entry.map(|entry| entry.path())),
        plugins,
    ))
}

fn scan(
    root: &Path,
    entries: impl IntoIterator<Item = io::Result<PathBuf>>,
    plugins: &Plugins,
) -> Discovery {
    let mut discovery = Discovery::default();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "unreadable plugin directory entry, skipping");
                continue;
            }
        };
        if !path.is_dir() {
            continue;
        }
        let Some(id) = path.file_name().and_then(|name| name.to_str()).map(String::from) else {
            warn!(path = %path.display(), "plugin directory name is not valid UTF-8, skipping");
            continue;
        };

        match load_manifest(&path, &id, plugins) {
            Ok(manifest) => {
                debug!(plugin = %id, version = %manifest.version, "discovered plugin manifest");
                // Tags of plugins that can never be grouped stay out of the docs.
                if let (Some(tag), Ok(_)) = (&manifest.tag, manifest.major_version()) {
                    discovery.tags.push(tag.clone());
                }
                discovery.manifests.insert(id, manifest);
            }
            Err(err) => {
                warn!(plugin = %id, error = %err, "skipping plugin");
                discovery.rejected.push(err);
            }
        }
    }
    discovery
}

fn load_manifest(dir: &Path, id: &str, plugins: &Plugins) -> Result<PluginManifest, DiscoveryError> {
    let entry_path = dir.join(plugins.entry_artifact(id));
    if !entry_path.is_file() {
        return Err(DiscoveryError::EntryMissing {
            plugin: id.to_string(),
            path: entry_path,
        });
    }

    let manifest_path = dir.join(&plugins.manifest_file);
    if !manifest_path.is_file() {
        return Err(DiscoveryError::ManifestMissing {
            plugin: id.to_string(),
            path: manifest_path,
        });
    }

    let raw = fs::read_to_string(&manifest_path).map_err(|source| {
        DiscoveryError::ManifestUnreadable {
            plugin: id.to_string(),
            path: manifest_path.clone(),
            source,
        }
    })?;
    let manifest: PluginManifest =
        serde_json::from_str(&raw).map_err(|source| DiscoveryError::ManifestMalformed {
            plugin: id.to_string(),
            path: manifest_path,
            source,
        })?;

    if let Some(field) = manifest.missing_field() {
        return Err(DiscoveryError::IncompleteManifest {
            plugin: id.to_string(),
            field,
        });
    }
    Ok(manifest)
}
