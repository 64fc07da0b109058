//! Environment resolution for services
//!
//! Sources, lowest precedence first: OS environment, caller-supplied extra
//! variables, the `.env` file, generated service bindings, and finally the
//! service's own `env` block. Values in the `env` block may reference
//! anything before them with `${VAR}` or `$VAR`.
//!
//! Containers never inherit the OS layer. Their images bring their own
//! `PATH` and `HOME`, and host credentials must not leak into them. A
//! container's `env` block can still reference OS variables explicitly.

use crate::runtime::{ServiceProcess, ServiceRuntime};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::path::Path;
use std::sync::LazyLock;

/// Default `.env` file name looked up in the project root
pub const DOTENV_FILE: &str = ".env";

/// Placeholder shown in place of secret values
pub const MASK: &str = "***";

/// `${VAR}` or `$VAR`
static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// Merges environment sources into the final environment of each service
#[derive(Debug, Clone, Default)]
pub struct EnvironmentResolver {
    /// Inherited process environment; native processes only
    os: IndexMap<String, String>,
    /// Extra variables and `.env` entries, handed to every service
    overrides: IndexMap<String, String>,
}

impl EnvironmentResolver {
    /// Resolver over the current process environment, `extra` and an
    /// optional `.env` file
    pub fn new(
        extra: &IndexMap<String, String>,
        env_file: Option<&Path>,
    ) -> Result<Self, EnvironmentError> {
        let os = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let mut resolver = Self {
            os,
            overrides: extra.clone(),
        };
        if let Some(path) = env_file {
            resolver.extend(load_dotenv(path)?);
        }
        Ok(resolver)
    }

    /// Resolver over explicit overrides, ignoring the process environment
    pub fn with_base(base: IndexMap<String, String>) -> Self {
        Self {
            os: IndexMap::new(),
            overrides: base,
        }
    }

    /// Replace the inherited OS layer
    pub fn with_os(mut self, os: IndexMap<String, String>) -> Self {
        self.os = os;
        self
    }

    /// Layer more variables over the overrides; later values win
    pub fn extend(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        self.overrides.extend(vars);
    }

    pub fn os(&self) -> &IndexMap<String, String> {
        &self.os
    }

    pub fn overrides(&self) -> &IndexMap<String, String> {
        &self.overrides
    }

    /// Final environment for one service
    pub fn resolve(
        &self,
        runtime: &ServiceRuntime,
        bindings: &IndexMap<String, String>,
    ) -> IndexMap<String, String> {
        let mut env = self.overrides.clone();
        env.extend(bindings.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut lookup = self.os.clone();
        lookup.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !runtime.is_container() {
            env = lookup.clone();
        }

        for (name, value) in &runtime.env {
            let value = substitute(value, &lookup);
            lookup.insert(name.clone(), value.clone());
            env.insert(name.clone(), value);
        }
        env
    }
}

/// Expand `${VAR}` and `$VAR` against `env`; unknown names expand to ""
pub fn substitute(value: &str, env: &IndexMap<String, String>) -> String {
    VARIABLE_PATTERN
        .replace_all(value, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            env.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// `SERVICE_<NAME>` suffix: upper-cased with `-` replaced by `_`
pub fn binding_name(service: &str) -> String {
    service.to_uppercase().replace('-', "_")
}

/// Discovery variables for every ready service that has a port
pub fn service_bindings<'a, I>(processes: I) -> IndexMap<String, String>
where
    I: IntoIterator<Item = &'a ServiceProcess>,
{
    let mut bindings = IndexMap::new();
    for process in processes {
        let (true, Some(port)) = (process.ready, process.port) else {
            continue;
        };
        let name = binding_name(&process.name);
        bindings.insert(
            format!("SERVICE_URL_{}", name),
            format!("http://localhost:{}", port),
        );
        bindings.insert(format!("SERVICE_PORT_{}", name), port.to_string());
        bindings.insert(format!("SERVICE_HOST_{}", name), "localhost".to_string());
    }
    bindings
}

/// Parse a `.env` file: `KEY=VALUE` lines, `#` comments and blank lines
/// skipped, surrounding quotes stripped
pub fn load_dotenv(path: &Path) -> Result<IndexMap<String, String>, EnvironmentError> {
    let content = std::fs::read_to_string(path).map_err(|e| EnvironmentError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(parse_dotenv(&content))
}

/// Load `<dir>/<filename>` if it exists
pub fn load_dotenv_if_exists(
    dir: &Path,
    filename: &str,
) -> Result<IndexMap<String, String>, EnvironmentError> {
    let path = dir.join(filename);
    if !path.exists() {
        return Ok(IndexMap::new());
    }
    load_dotenv(&path)
}

fn parse_dotenv(content: &str) -> IndexMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

/// Whether a variable name looks like it holds a credential
pub fn is_secret(key: &str) -> bool {
    let key = key.to_uppercase();
    key.contains("SECRET")
        || key.contains("PASSWORD")
        || key.contains("TOKEN")
        || (key.contains("KEY") && !key.contains("PUBLIC"))
}

/// Copy of `env` with credential values replaced for display
pub fn mask_secrets(env: &IndexMap<String, String>) -> IndexMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let value = if is_secret(k) { MASK.to_string() } else { v.clone() };
            (k.clone(), value)
        })
        .collect()
}

/// Errors that can occur while loading environment sources
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("Failed to read env file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
