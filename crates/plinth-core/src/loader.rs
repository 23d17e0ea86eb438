use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Result;
use plinth_plugin_sdk::{
    version::{is_compatible, VersionError},
    PluginManifest, PluginTag, Routes,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    discovery::{self, ManifestTable},
    plugin::PluginRegistry,
};

/// The one capability the loader needs from the HTTP transport.
pub trait RouteMount {
    fn mount(&mut self, prefix: &str, plugin: MountedPlugin) -> Result<()>;
}

/// A plugin's routes bundled with the manifest they were resolved from.
pub struct MountedPlugin {
    pub id: String,
    pub manifest: Arc<PluginManifest>,
    pub routes: Routes,
}

impl MountedPlugin {
    pub fn new(id: impl Into<String>, manifest: PluginManifest, routes: Routes) -> Self {
        Self {
            id: id.into(),
            manifest: Arc::new(manifest),
            routes,
        }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    IncompatibleVersion { major: u64, api: u64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled by configuration"),
            SkipReason::IncompatibleVersion { major, api } => {
                write!(f, "declares major version {major}, API is v{api}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("plugin '{plugin}': {source}")]
    InvalidVersionFormat { plugin: String, source: VersionError },

    #[error("plugin '{plugin}': depends on '{dependency}' which is not installed")]
    MissingDependency { plugin: String, dependency: String },

    #[error("plugin '{plugin}': dependency '{dependency}' has {source}")]
    DependencyVersion {
        plugin: String,
        dependency: String,
        source: VersionError,
    },

    #[error(
        "plugin '{plugin}': depends on '{dependency}' (major {major}) which is not compatible with API v{api}"
    )]
    IncompatibleDependency {
        plugin: String,
        dependency: String,
        major: u64,
        api: u64,
    },

    #[error("plugin '{plugin}': dependency '{dependency}' did not activate ({state})")]
    DependencyNotActivated {
        plugin: String,
        dependency: String,
        state: String,
    },

    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("plugin '{plugin}': no implementation registered for this id")]
    NotRegistered { plugin: String },

    #[error("plugin '{plugin}': failed to obtain handler: {details}")]
    HandlerAcquisition { plugin: String, details: String },

    #[error("plugin '{plugin}': implementation registered no routes")]
    NoRoutes { plugin: String },

    #[error("plugin '{plugin}': mount rejected: {details}")]
    MountRejected { plugin: String, details: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationState {
    Discovered,
    Skipped(SkipReason),
    Activating,
    Activated,
    Failed(LoadError),
}

impl ActivationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActivationState::Skipped(_) | ActivationState::Activated | ActivationState::Failed(_)
        )
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationState::Discovered => write!(f, "discovered"),
            ActivationState::Skipped(reason) => write!(f, "skipped: {reason}"),
            ActivationState::Activating => write!(f, "activating"),
            ActivationState::Activated => write!(f, "activated"),
            ActivationState::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Plugins grouped by the major version their manifest declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionGroup {
    pub version: u64,
    pub plugin_count: usize,
    pub plugins: Vec<String>,
}

impl VersionGroup {
    fn new(version: u64) -> Self {
        Self {
            version,
            plugin_count: 0,
            plugins: Vec::new(),
        }
    }

    fn add(&mut self, id: &str) {
        if !self.plugins.iter().any(|existing| existing == id) {
            self.plugins.push(id.to_string());
            self.plugin_count = self.plugins.len();
        }
    }
}

/// Partitions the table by major version. The target group is always first.
/// Ids whose version is malformed land in no group.
pub fn partition(table: &ManifestTable, api_major: u64) -> Vec<VersionGroup> {
    let mut groups = vec![VersionGroup::new(api_major)];
    for (id, manifest) in table.iter() {
        let major = match manifest.major_version() {
            Ok(major) => major,
            Err(err) => {
                error!(plugin = %id, error = %err, "plugin version is malformed; it will not be grouped");
                continue;
            }
        };
        match groups.iter_mut().find(|group| group.version == major) {
            Some(group) => group.add(id),
            None => {
                let mut group = VersionGroup::new(major);
                group.add(id);
                groups.push(group);
            }
        }
    }
    groups
}

/// Immutable snapshot of one startup loading pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub tags: Vec<PluginTag>,
    pub versions: Vec<VersionGroup>,
    pub compatible_plugins: Vec<String>,
    #[serde(skip)]
    states: HashMap<String, ActivationState>,
}

impl LoadReport {
    pub fn state(&self, id: &str) -> Option<&ActivationState> {
        self.states.get(id)
    }

    pub fn is_activated(&self, id: &str) -> bool {
        matches!(self.state(id), Some(ActivationState::Activated))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &LoadError)> {
        self.states.iter().filter_map(|(id, state)| match state {
            ActivationState::Failed(err) => Some((id.as_str(), err)),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&str, &SkipReason)> {
        self.states.iter().filter_map(|(id, state)| match state {
            ActivationState::Skipped(reason) => Some((id.as_str(), reason)),
            _ => None,
        })
    }
}

/// Resolves dependencies and mounts plugins for one API major version.
///
/// Holds the manifest table, the per-id activation state and the stack of ids
/// currently being activated, which doubles as the cycle detector.
pub struct Resolver<'a, M: RouteMount> {
    table: &'a ManifestTable,
    registry: &'a PluginRegistry,
    mount: &'a mut M,
    api_major: u64,
    prefix: String,
    states: HashMap<String, ActivationState>,
    visiting: Vec<String>,
    activated: Vec<String>,
}

impl<'a, M: RouteMount> Resolver<'a, M> {
    pub fn new(
        table: &'a ManifestTable,
        registry: &'a PluginRegistry,
        mount: &'a mut M,
        api_major: u64,
    ) -> Self {
        let states = table
            .ids()
            .map(|id| (id.to_string(), ActivationState::Discovered))
            .collect();
        Self {
            table,
            registry,
            mount,
            api_major,
            prefix: format!("/api/v{api_major}"),
            states,
            visiting: Vec::new(),
            activated: Vec::new(),
        }
    }

    pub fn state(&self, id: &str) -> Option<&ActivationState> {
        self.states.get(id)
    }

    /// Ids in the order they reached `Activated`.
    pub fn activated(&self) -> &[String] {
        &self.activated
    }

    pub fn activate(&mut self, id: &str) {
        let table = self.table;
        let Some(manifest) = table.get(id) else {
            return;
        };
        if self.state(id).is_some_and(ActivationState::is_terminal) {
            return;
        }

        if !manifest.enabled {
            info!(plugin = %id, "plugin is disabled, skipping");
            self.set(id, ActivationState::Skipped(SkipReason::Disabled));
            return;
        }

        let major = match manifest.major_version() {
            Ok(major) => major,
            Err(source) => {
                self.fail(
                    id,
                    LoadError::InvalidVersionFormat {
                        plugin: id.to_string(),
                        source,
                    },
                );
                return;
            }
        };
        if !is_compatible(major, self.api_major) {
            warn!(
                plugin = %id,
                version = %manifest.version,
                api = self.api_major,
                "plugin is not compatible with the API version, skipping"
            );
            let reason = SkipReason::IncompatibleVersion {
                major,
                api: self.api_major,
            };
            self.set(id, ActivationState::Skipped(reason));
            return;
        }

        self.set(id, ActivationState::Activating);
        self.visiting.push(id.to_string());
        let outcome = self
            .resolve_dependencies(id, manifest)
            .and_then(|()| self.mount_plugin(id, manifest));
        self.visiting.pop();

        match outcome {
            Ok(()) => {
                info!(plugin = %id, name = %manifest.name, "plugin loaded");
                self.set(id, ActivationState::Activated);
                self.activated.push(id.to_string());
            }
            Err(err) => self.fail(id, err),
        }
    }

    pub fn finish(self, tags: Vec<PluginTag>, versions: Vec<VersionGroup>) -> LoadReport {
        metrics::gauge!("plinth_plugins_activated").set(self.activated.len() as f64);
        LoadReport {
            tags,
            versions,
            compatible_plugins: self.activated,
            states: self.states,
        }
    }

    fn resolve_dependencies(&mut self, id: &str, manifest: &PluginManifest) -> Result<(), LoadError> {
        let table = self.table;
        for dep in &manifest.dependencies {
            if matches!(self.state(dep), Some(ActivationState::Activated)) {
                continue;
            }
            let Some(dep_manifest) = table.get(dep) else {
                return Err(LoadError::MissingDependency {
                    plugin: id.to_string(),
                    dependency: dep.clone(),
                });
            };
            let dep_major = dep_manifest
                .major_version()
                .map_err(|source| LoadError::DependencyVersion {
                    plugin: id.to_string(),
                    dependency: dep.clone(),
                    source,
                })?;
            if !is_compatible(dep_major, self.api_major) {
                return Err(LoadError::IncompatibleDependency {
                    plugin: id.to_string(),
                    dependency: dep.clone(),
                    major: dep_major,
                    api: self.api_major,
                });
            }
            if let Some(start) = self.visiting.iter().position(|visiting| visiting == dep) {
                let mut cycle = self.visiting[start..].to_vec();
                cycle.push(dep.clone());
                return Err(LoadError::CycleDetected { cycle });
            }

            self.activate(dep);

            match self.state(dep) {
                Some(ActivationState::Activated) => {}
                Some(ActivationState::Failed(LoadError::CycleDetected { cycle }))
                    if cycle.iter().any(|member| member == id) =>
                {
                    return Err(LoadError::CycleDetected {
                        cycle: cycle.clone(),
                    });
                }
                other => {
                    let state = other
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(LoadError::DependencyNotActivated {
                        plugin: id.to_string(),
                        dependency: dep.clone(),
                        state,
                    });
                }
            }
        }
        Ok(())
    }

    fn mount_plugin(&mut self, id: &str, manifest: &PluginManifest) -> Result<(), LoadError> {
        let factory = self.registry.get(id).ok_or_else(|| LoadError::NotRegistered {
            plugin: id.to_string(),
        })?;
        let acquisition = |err: anyhow::Error| LoadError::HandlerAcquisition {
            plugin: id.to_string(),
            details: format!("{err:#}"),
        };
        let plugin = factory().map_err(acquisition)?;
        let mut routes = Routes::new();
        plugin.mount(&mut routes).map_err(acquisition)?;
        if routes.is_empty() {
            return Err(LoadError::NoRoutes {
                plugin: id.to_string(),
            });
        }

        let mounted = MountedPlugin::new(id, manifest.clone(), routes);
        self.mount
            .mount(&self.prefix, mounted)
            .map_err(|err| LoadError::MountRejected {
                plugin: id.to_string(),
                details: format!("{err:#}"),
            })
    }

    fn set(&mut self, id: &str, state: ActivationState) {
        self.states.insert(id.to_string(), state);
    }

    fn fail(&mut self, id: &str, err: LoadError) {
        error!(plugin = %id, error = %err, "failed to load plugin");
        self.set(id, ActivationState::Failed(err));
    }
}

/// Discovers manifests under the configured root and activates the plugins
/// belonging to the configured API major version.
pub struct Loader<'a> {
    config: &'a Config,
    registry: &'a PluginRegistry,
}

impl<'a> Loader<'a> {
    pub fn new(config: &'a Config, registry: &'a PluginRegistry) -> Self {
        Self { config, registry }
    }

    pub fn load<M: RouteMount>(&self, mount: &mut M) -> Result<LoadReport> {
        let discovery = discovery::discover(&self.config.plugins.root, &self.config.plugins)?;
        Ok(self.activate(&discovery.manifests, discovery.tags, mount))
    }

    /// Runs the activation pass over an already discovered table.
    pub fn activate<M: RouteMount>(
        &self,
        table: &ManifestTable,
        tags: Vec<PluginTag>,
        mount: &mut M,
    ) -> LoadReport {
        let api_major = self.config.api.version;
        let versions = partition(table, api_major);
        let mut resolver = Resolver::new(table, self.registry, mount, api_major);
        if let Some(target) = versions.iter().find(|group| group.version == api_major) {
            for id in &target.plugins {
                resolver.activate(id);
            }
        }
        let report = resolver.finish(tags, versions);
        info!(
            api = api_major,
            discovered = table.len(),
            activated = report.compatible_plugins.len(),
            "plugin loading complete"
        );
        report
    }
}
