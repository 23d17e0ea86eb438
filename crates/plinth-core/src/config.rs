use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Root configuration structure deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub api: Api,
    pub plugins: Plugins,
    pub docs: Docs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub bind: String,
    pub max_body_bytes: usize,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: ":3000".into(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Api {
    pub version: u64,
    pub title: String,
    pub environment: String,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            version: 1,
            title: "Plinth API".into(),
            environment: "development".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Plugins {
    pub root: PathBuf,
    pub manifest_file: String,
    pub entry_suffix: String,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            root: PathBuf::from("plugins"),
            manifest_file: "plugin.config.json".into(),
            entry_suffix: ".plugin.rs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Docs {
    pub path: String,
}

impl Default for Docs {
    fn default() -> Self {
        Self {
            path: "/api/docs".into(),
        }
    }
}

impl Config {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.plugins.validate()?;
        self.docs.validate()?;
        let prefix = self.api.prefix();
        if self.docs.path == prefix || self.docs.path.starts_with(&format!("{prefix}/")) {
            bail!(
                "docs path `{}` must not live under the plugin prefix `{prefix}`",
                self.docs.path
            );
        }
        Ok(())
    }
}

impl Server {
    pub fn validate(&self) -> Result<()> {
        self.parse_bind_addr()
            .with_context(|| format!("invalid bind address `{}`", self.bind))?;
        if self.max_body_bytes == 0 {
            bail!("server.max_body_bytes must be greater than zero");
        }
        Ok(())
    }

    pub fn parse_bind_addr(&self) -> Result<SocketAddr> {
        if self.bind.starts_with(':') {
            let addr = format!("0.0.0.0{}", self.bind);
            Ok(SocketAddr::from_str(&addr)?)
        } else {
            Ok(SocketAddr::from_str(&self.bind)?)
        }
    }
}

impl Api {
    /// Route namespace every activated plugin is mounted under.
    pub fn prefix(&self) -> String {
        format!("/api/v{}", self.version)
    }
}

impl Plugins {
    pub fn validate(&self) -> Result<()> {
        if self.manifest_file.trim().is_empty() {
            bail!("plugins.manifest_file must not be empty");
        }
        if self.entry_suffix.trim().is_empty() {
            bail!("plugins.entry_suffix must not be empty");
        }
        Ok(())
    }

    pub fn entry_artifact(&self, id: &str) -> String {
        format!("{id}{}", self.entry_suffix)
    }
}

impl Docs {
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') || self.path.len() < 2 {
            bail!("docs.path `{}` must be an absolute route like /api/docs", self.path);
        }
        Ok(())
    }

    pub fn json_path(&self) -> String {
        format!("{}/json", self.path.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_shorthand_defaults_to_all_interfaces() {
        let server = Server {
            bind: ":8080".into(),
            ..Server::default()
        };
        assert_eq!(
            server.parse_bind_addr().unwrap(),
            SocketAddr::from_str("0.0.0.0:8080").unwrap()
        );
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.api.prefix(), "/api/v1");
        assert_eq!(config.plugins.entry_artifact("notes"), "notes.plugin.rs");
        assert_eq!(config.docs.json_path(), "/api/docs/json");
    }

    #[test]
    fn docs_cannot_shadow_plugin_routes() {
        let mut config = Config::default();
        config.docs.path = "/api/v1/docs".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("plugin prefix"));
    }

    #[test]
    fn relative_docs_path_is_rejected() {
        let mut config = Config::default();
        config.docs.path = "docs".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [api]
            version = 2

            [plugins]
            root = "/srv/plugins"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.version, 2);
        assert_eq!(config.api.title, "Plinth API");
        assert_eq!(config.plugins.manifest_file, "plugin.config.json");
        assert_eq!(config.plugins.root, PathBuf::from("/srv/plugins"));
    }
}
