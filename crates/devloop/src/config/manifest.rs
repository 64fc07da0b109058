//! Manifest YAML schema definitions

use crate::logs::LogFilter;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default manifest file name looked up in the project root
pub const DEFAULT_MANIFEST: &str = "devloop.yaml";

/// Root manifest configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Project name (informational)
    #[serde(default)]
    pub name: Option<String>,

    /// Services to run (ordered map for deterministic iteration)
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,

    /// External resources services may depend on. Never started here.
    #[serde(default)]
    pub resources: IndexMap<String, ResourceConfig>,

    /// Log collection settings
    #[serde(default)]
    pub logs: LogsConfig,
}

/// Log collection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default)]
    pub filters: Option<LogFilterConfig>,
}

/// Lines to drop before they reach a log buffer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterConfig {
    /// Extra case-insensitive regular expressions
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Keep the built-in noise patterns (default: true)
    #[serde(default)]
    pub include_builtins: Option<bool>,
}

impl LogsConfig {
    /// Compile the filter for this manifest plus `extra` patterns from the
    /// command line
    pub fn build_filter(&self, extra: &[String]) -> Result<LogFilter, regex::Error> {
        let (exclude, builtins) = match &self.filters {
            Some(f) => (f.exclude.as_slice(), f.include_builtins.unwrap_or(true)),
            None => (&[][..], true),
        };
        let custom = exclude.iter().chain(extra);
        if builtins {
            LogFilter::with_builtins(custom)
        } else {
            LogFilter::new(custom)
        }
    }
}

/// Environment values can be strings, booleans, or numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl EnvValue {
    /// Convert to string representation
    pub fn as_str(&self) -> String {
        match self {
            EnvValue::Bool(b) => b.to_string(),
            EnvValue::Int(i) => i.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::String(s) => s.clone(),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        EnvValue::String(s.to_string())
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Container image. Mutually exclusive with `command`.
    #[serde(default)]
    pub image: Option<String>,

    /// Executable for a native process. Mutually exclusive with `image`.
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments passed to `command`
    #[serde(default)]
    pub args: Vec<String>,

    /// Services or resources that must be ready first
    #[serde(default)]
    pub uses: Vec<String>,

    /// Environment variables specific to this service; values may reference
    /// other variables with `${VAR}`
    #[serde(default)]
    pub env: IndexMap<String, EnvValue>,

    /// Port the service listens on
    #[serde(default)]
    pub port: Option<u16>,

    /// Working directory, relative to the project root
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Readiness probe
    #[serde(default)]
    pub healthcheck: HealthCheckConfig,
}

impl ServiceConfig {
    pub fn is_container(&self) -> bool {
        self.image.is_some()
    }

    /// Declared environment with every value rendered as a string
    pub fn environment(&self) -> IndexMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str()))
            .collect()
    }
}

/// Resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource kind, e.g. `postgres` or `redis`
    #[serde(rename = "type")]
    pub resource_type: String,
}

/// How readiness is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// HTTP request to `path` answers with 2xx or 3xx
    Http,
    /// TCP connect to the service port succeeds
    Port,
    /// A log line contains `pattern`
    Log,
    /// The process or container is alive
    Process,
    /// Ready as soon as it is started
    None,
}

/// Readiness probe settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe type; defaults to `http` when a port is declared, else `process`
    #[serde(rename = "type", default)]
    pub check_type: Option<HealthCheckType>,

    /// Port to probe when it differs from the service port
    #[serde(default)]
    pub port: Option<u16>,

    /// Request path for `type: http` (default `/`)
    #[serde(default)]
    pub path: Option<String>,

    /// Substring to look for with `type: log`
    #[serde(default)]
    pub pattern: Option<String>,

    /// Overall deadline in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Initial delay between probes in milliseconds
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

impl Manifest {
    /// Load a manifest from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a manifest from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(content).map_err(ManifestError::Parse)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate per-service settings. Dependency references are checked when
    /// the dependency graph is built.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (name, service) in &self.services {
            match (&service.image, &service.command) {
                (Some(_), None) | (None, Some(_)) => {}
                (Some(_), Some(_)) => {
                    return Err(ManifestError::Validation(format!(
                        "Service '{}': cannot specify both 'image' and 'command'",
                        name
                    )));
                }
                (None, None) => {
                    return Err(ManifestError::Validation(format!(
                        "Service '{}': must specify either 'image' or 'command'",
                        name
                    )));
                }
            }

            if service.port == Some(0) {
                return Err(ManifestError::Validation(format!(
                    "Service '{}': port must be between 1 and 65535",
                    name
                )));
            }

            let check = &service.healthcheck;
            if check.check_type == Some(HealthCheckType::Log)
                && check.pattern.as_deref().unwrap_or("").is_empty()
            {
                return Err(ManifestError::Validation(format!(
                    "Service '{}': log healthcheck requires a 'pattern'",
                    name
                )));
            }
            if let Some(kind @ (HealthCheckType::Port | HealthCheckType::Http)) = check.check_type {
                if check.port.or(service.port).is_none() {
                    return Err(ManifestError::Validation(format!(
                        "Service '{}': {} healthcheck requires a port",
                        name,
                        if kind == HealthCheckType::Http { "http" } else { "port" }
                    )));
                }
            }
        }

        self.logs.build_filter(&[]).map_err(|e| {
            ManifestError::Validation(format!("logs.filters: invalid pattern: {}", e))
        })?;

        Ok(())
    }

    /// Names of services backed by a container image
    pub fn container_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, s)| s.is_container())
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Errors that can occur when loading a manifest
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
