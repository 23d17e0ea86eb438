use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::{major_version, VersionError};

/// On-disk JSON manifest located next to each plugin's entry artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<PluginTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PluginMetadata>,
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            dependencies: Vec::new(),
            enabled: true,
            tag: None,
            metadata: None,
        }
    }
}

/// Documentation tag grouping a plugin's routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginTag {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PluginManifest {
    /// Name of the first required field that is absent or blank.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.name.trim().is_empty() {
            Some("name")
        } else if self.version.trim().is_empty() {
            Some("version")
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_field().is_none()
    }

    pub fn major_version(&self) -> Result<u64, VersionError> {
        major_version(&self.version)
    }

    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.iter().any(|dep| dep == id)
    }

    pub fn description(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.description.as_deref())
            .or_else(|| self.tag.as_ref().map(|tag| tag.description.as_str()))
            .filter(|desc| !desc.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_take_defaults() {
        let manifest: PluginManifest =
            serde_json::from_str(r#"{"name":"Notes","version":"1.0.0"}"#).unwrap();
        assert!(manifest.enabled);
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.tag.is_none());
        assert!(manifest.is_complete());
        assert_eq!(manifest.major_version().unwrap(), 1);
    }

    #[test]
    fn full_manifest_parses() {
        let manifest: PluginManifest = serde_json::from_str(
            r#"{
                "name": "Orders",
                "version": "1.2.0",
                "dependencies": ["catalog", "auth"],
                "enabled": false,
                "tag": {"name": "Orders", "description": "Order management"},
                "metadata": {"author": "ops", "keywords": ["orders"], "sla": "gold"}
            }"#,
        )
        .unwrap();
        assert!(!manifest.enabled);
        assert_eq!(manifest.dependencies, vec!["catalog", "auth"]);
        assert!(manifest.depends_on("auth"));
        let metadata = manifest.metadata.unwrap();
        assert_eq!(metadata.author.as_deref(), Some("ops"));
        assert_eq!(metadata.extra.get("sla"), Some(&Value::from("gold")));
    }

    #[test]
    fn blank_required_fields_are_reported() {
        let manifest: PluginManifest = serde_json::from_str(r#"{"version":"1.0.0"}"#).unwrap();
        assert_eq!(manifest.missing_field(), Some("name"));

        let manifest: PluginManifest =
            serde_json::from_str(r#"{"name":"x","version":"  "}"#).unwrap();
        assert_eq!(manifest.missing_field(), Some("version"));
    }

    #[test]
    fn wrongly_typed_fields_fail_to_parse() {
        assert!(serde_json::from_str::<PluginManifest>(r#"{"name":5,"version":"1"}"#).is_err());
    }
}
