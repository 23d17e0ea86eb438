use thiserror::Error;

/// Raised when a version string has no leading major number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version format: `{version}`")]
pub struct VersionError {
    pub version: String,
}

/// Extracts the leading run of digits from `version` as the major version.
pub fn major_version(version: &str) -> Result<u64, VersionError> {
    let end = version
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(version.len());
    version[..end].parse::<u64>().map_err(|_| VersionError {
        version: version.to_string(),
    })
}

/// Plugins are only compatible with the API major they were written for.
pub fn is_compatible(plugin_major: u64, api_major: u64) -> bool {
    plugin_major == api_major
}
