use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{InjectError, Result};

/// Placeholder replaced by the logical CA name in custom-location patterns.
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Run configuration for an injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    /// Logical name of the injected CA (file name stem and keystore alias)
    pub ca_name: String,

    /// Password used to load and store Java keystores
    pub java_password: String,

    /// Well-known trust-store locations
    pub tables: TrustStoreTables,

    /// Log level
    pub log_level: LogLevel,

    /// Log every entry of the original layers while they are written out
    pub trace_layers: bool,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            ca_name: "image-ca-injector".to_string(),
            java_password: "changeit".to_string(),
            tables: TrustStoreTables::default(),
            log_level: LogLevel::Warn,
            trace_layers: false,
        }
    }
}

impl InjectConfig {
    /// Load a configuration file. `.json` files are parsed as JSON,
    /// everything else as YAML. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            InjectError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: InjectConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the handlers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.ca_name.trim().is_empty() {
            return Err(InjectError::ConfigError("CA name must not be empty".to_string()));
        }
        if self.ca_name.contains('/') {
            return Err(InjectError::ConfigError(format!(
                "CA name must not contain '/': {}",
                self.ca_name
            )));
        }
        for location in &self.tables.custom_locations {
            if !location.file_pattern.contains(NAME_PLACEHOLDER) {
                return Err(InjectError::ConfigError(format!(
                    "File pattern for {} lacks {}: {}",
                    location.directory, NAME_PLACEHOLDER, location.file_pattern
                )));
            }
            if !location.directory.starts_with('/') {
                return Err(InjectError::ConfigError(format!(
                    "Custom location must be absolute: {}",
                    location.directory
                )));
            }
        }
        for (vendor, directory) in &self.tables.distro_locations {
            if self.tables.custom_location(directory).is_none() {
                return Err(InjectError::ConfigError(format!(
                    "Directory {} for {} is not a known custom location",
                    directory, vendor
                )));
            }
        }
        Ok(())
    }
}

/// A distribution-specific "drop a file here" trust anchor directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomLocation {
    /// Absolute directory inside the image
    pub directory: String,
    /// File name pattern, `{name}` is replaced by the CA name
    pub file_pattern: String,
}

impl CustomLocation {
    pub fn new(directory: impl Into<String>, file_pattern: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            file_pattern: file_pattern.into(),
        }
    }

    /// Absolute path of the file to create for `name`.
    pub fn file_path(&self, name: &str) -> String {
        let file_name = self.file_pattern.replace(NAME_PLACEHOLDER, name);
        format!("{}/{}", self.directory.trim_end_matches('/'), file_name)
    }
}

/// Fixed tables describing where trust stores live in common images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustStoreTables {
    /// PEM bundle files, in lookup order
    pub pem_bundles: Vec<String>,

    /// Path suffix identifying Java trust stores
    pub java_truststore_suffix: String,

    /// Custom anchor directories, in lookup order
    pub custom_locations: Vec<CustomLocation>,

    /// Vendor id (from os-release `ID`) to custom anchor directory
    pub distro_locations: BTreeMap<String, String>,
}

impl Default for TrustStoreTables {
    fn default() -> Self {
        let pem_bundles = [
            // Debian, Ubuntu, Gentoo
            "/etc/ssl/certs/ca-certificates.crt",
            // Fedora, RHEL 6
            "/etc/pki/tls/certs/ca-bundle.crt",
            // OpenSUSE
            "/etc/ssl/ca-bundle.pem",
            // OpenELEC
            "/etc/pki/tls/cacert.pem",
            // CentOS, RHEL 7
            "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
            // Alpine
            "/etc/ssl/cert.pem",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let custom_locations = vec![
            CustomLocation::new("/etc/pki/ca-trust/source/anchors", "{name}.pem"),
            CustomLocation::new("/usr/local/share/ca-certificates", "{name}.crt"),
            CustomLocation::new("/etc/ca-certificates/trust-source/anchors", "{name}.crt"),
            CustomLocation::new("/usr/share/pki/trust/anchors", "{name}.pem"),
        ];

        let mut distro_locations = BTreeMap::new();
        distro_locations.insert(
            "alpine".to_string(),
            "/usr/local/share/ca-certificates".to_string(),
        );

        Self {
            pem_bundles,
            java_truststore_suffix: "/lib/security/cacerts".to_string(),
            custom_locations,
            distro_locations,
        }
    }
}

impl TrustStoreTables {
    /// Tables with nothing in them.
    pub fn empty() -> Self {
        Self {
            pem_bundles: Vec::new(),
            java_truststore_suffix: String::new(),
            custom_locations: Vec::new(),
            distro_locations: BTreeMap::new(),
        }
    }

    /// Look up the custom location registered for a directory.
    pub fn custom_location(&self, directory: &str) -> Option<&CustomLocation> {
        self.custom_locations
            .iter()
            .find(|l| l.directory == directory)
    }

    /// Custom location registered for a distribution vendor id.
    pub fn distro_location(&self, vendor: &str) -> Option<&CustomLocation> {
        self.distro_locations
            .get(vendor)
            .and_then(|dir| self.custom_location(dir))
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}
