//! Command-line interface for devloop

use crate::config::{Manifest, DEFAULT_MANIFEST};
use crate::logs::LogConfig;
use crate::runtime::{DependencyError, DependencyGraph, OrchestratorConfig};
use argh::FromArgs;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run a project's services locally in dependency order
#[derive(FromArgs, Debug)]
pub struct RunArgs {
    /// path to the manifest (default: devloop.yaml)
    #[argh(positional, default = "String::from(DEFAULT_MANIFEST)")]
    pub manifest: String,

    /// only run these services and what they use (comma-separated)
    #[argh(option, short = 's', from_str_fn(parse_services))]
    pub services: Option<Vec<String>>,

    /// extra environment variable for every service (format: KEY=VALUE)
    #[argh(option, short = 'e', from_str_fn(parse_env_pair))]
    pub env: Vec<(String, String)>,

    /// drop log lines matching these regular expressions (comma-separated)
    #[argh(option, from_str_fn(parse_patterns))]
    pub exclude: Option<Vec<String>>,

    /// env file to load (default: .env next to the manifest, if present)
    #[argh(option)]
    pub env_file: Option<String>,

    /// recreate containers even if they are already running
    #[argh(switch)]
    pub restart_containers: bool,

    /// container engine binary (default: docker)
    #[argh(option, default = "String::from(\"docker\")")]
    pub engine: String,

    /// seconds each service may take to become ready (default: 60)
    #[argh(option, default = "60")]
    pub health_timeout: u64,

    /// keep logs in memory only
    #[argh(switch)]
    pub no_file_logs: bool,

    /// show launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// print the launch plan or validation result as JSON
    #[argh(switch)]
    pub json: bool,

    /// validate the manifest and exit
    #[argh(switch)]
    pub validate: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse an environment pair in format "KEY=VALUE"
fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!(
            "Invalid environment format '{}'. Expected 'KEY=VALUE'",
            s
        )),
    }
}

/// Parse comma-separated service list
fn parse_services(s: &str) -> Result<Vec<String>, String> {
    Ok(s.split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

/// Parse comma-separated log filter patterns
fn parse_patterns(s: &str) -> Result<Vec<String>, String> {
    let patterns: Vec<String> = s
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    for pattern in &patterns {
        regex::Regex::new(pattern)
            .map_err(|e| format!("Invalid exclude pattern '{}': {}", pattern, e))?;
    }
    Ok(patterns)
}

impl RunArgs {
    /// Extra environment as an ordered map; later pairs win
    pub fn extra_env(&self) -> IndexMap<String, String> {
        self.env.iter().cloned().collect()
    }

    /// Directory the manifest lives in
    pub fn project_dir(&self) -> PathBuf {
        match Path::new(&self.manifest).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Normalized log filter for env_logger
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }

    /// Dependency graph of `manifest`, narrowed by `-s` when given
    pub fn graph(&self, manifest: &Manifest) -> Result<DependencyGraph, DependencyError> {
        let graph = DependencyGraph::build(manifest)?;
        match &self.services {
            Some(services) if !services.is_empty() => graph.filter(services),
            _ => Ok(graph),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            project_dir: self.project_dir(),
            restart_containers: self.restart_containers,
            health_timeout: Duration::from_secs(self.health_timeout),
            extra_env: self.extra_env(),
            env_file: self.env_file.as_ref().map(PathBuf::from),
            services: self.services.clone().unwrap_or_default(),
            log_exclude: self.exclude.clone().unwrap_or_default(),
            log: LogConfig {
                file_logging: !self.no_file_logs,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        let result = parse_env_pair("DATABASE_URL=postgres://u:p@localhost/db?x=1");
        assert_eq!(
            result,
            Ok((
                "DATABASE_URL".to_string(),
                "postgres://u:p@localhost/db?x=1".to_string()
            ))
        );
        assert_eq!(parse_env_pair("EMPTY="), Ok(("EMPTY".to_string(), String::new())));
    }

    #[test]
    fn test_parse_env_pair_invalid() {
        assert!(parse_env_pair("invalid").is_err());
        assert!(parse_env_pair("=value").is_err());
    }

    #[test]
    fn test_parse_services() {
        assert_eq!(
            parse_services("web, api,,worker"),
            Ok(vec![
                "web".to_string(),
                "api".to_string(),
                "worker".to_string()
            ])
        );
    }

    #[test]
    fn test_orchestrator_config() {
        let args = RunArgs::from_args(
            &["devloop"],
            &[
                "shop/devloop.yaml",
                "-s",
                "web",
                "-e",
                "MODE=dev",
                "-e",
                "MODE=test",
                "--no-file-logs",
                "--restart-containers",
                "--exclude",
                "^GET /health, heartbeat",
            ],
        )
        .unwrap();

        let config = args.orchestrator_config();
        assert_eq!(config.project_dir, PathBuf::from("shop"));
        assert_eq!(config.services, vec!["web"]);
        assert_eq!(config.extra_env["MODE"], "test");
        assert!(config.restart_containers);
        assert!(!config.log.file_logging);
        assert_eq!(config.log_exclude, vec!["^GET /health", "heartbeat"]);
        assert_eq!(config.health_timeout, Duration::from_secs(60));
        assert_eq!(args.log_filter(), "info");
    }

    #[test]
    fn test_parse_patterns_rejects_invalid_regex() {
        assert!(parse_patterns("ok,(unclosed").is_err());
        assert_eq!(parse_patterns(" a , ,b"), Ok(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_graph_honors_service_selection() {
        let manifest = Manifest::from_yaml(
            r#"
services:
  web:
    command: ./web
    uses: [api]
  api:
    command: ./api
    uses: [db]
  worker:
    command: ./worker
resources:
  db:
    type: postgres
"#,
        )
        .unwrap();

        let args = RunArgs::from_args(&["devloop"], &["--validate", "-s", "api"]).unwrap();
        let graph = args.graph(&manifest).unwrap();
        assert_eq!(graph.levels(), vec![vec!["api".to_string()]]);
        assert!(graph.contains("db"));
        assert!(!graph.contains("worker"));

        let args = RunArgs::from_args(&["devloop"], &["--validate"]).unwrap();
        assert_eq!(args.graph(&manifest).unwrap().len(), 4);

        let args = RunArgs::from_args(&["devloop"], &["--validate", "-s", "ghost"]).unwrap();
        assert!(matches!(
            args.graph(&manifest),
            Err(DependencyError::UnknownService(_))
        ));
    }
}
