//! Unified service handle and lifecycle controller
//!
//! A started service is a [`ServiceProcess`] whether it runs as a native
//! process or as a container. [`ServiceController`] picks the right runner
//! for each [`ServiceRuntime`] so callers only deal with one start/stop
//! contract.

use super::container::ContainerRunner;
use super::engine::{ContainerEngine, EngineError};
use super::process::ProcessRunner;
use crate::config::{HealthCheckConfig, ServiceConfig};
use crate::logs::LogManager;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;

/// How a service is executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServiceKind {
    Container { image: String },
    Process { command: String, args: Vec<String> },
}

/// Everything needed to start one service, resolved from the manifest
#[derive(Debug, Clone)]
pub struct ServiceRuntime {
    pub name: String,
    pub kind: ServiceKind,
    pub port: Option<u16>,
    /// Declared environment, before resolution
    pub env: IndexMap<String, String>,
    pub working_dir: PathBuf,
    pub healthcheck: HealthCheckConfig,
}

impl ServiceRuntime {
    /// Snapshot a manifest entry. Relative working directories are taken
    /// from `project_dir`.
    pub fn from_config(
        name: &str,
        config: &ServiceConfig,
        project_dir: &Path,
    ) -> Result<Self, LifecycleError> {
        let kind = match (&config.image, &config.command) {
            (Some(image), _) if !image.trim().is_empty() => ServiceKind::Container {
                image: image.clone(),
            },
            (None, Some(command)) => ServiceKind::Process {
                command: command.clone(),
                args: config.args.clone(),
            },
            _ => return Err(LifecycleError::MissingImage(name.to_string())),
        };

        let working_dir = match &config.working_dir {
            Some(dir) => project_dir.join(dir),
            None => project_dir.to_path_buf(),
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            port: config.port,
            env: config.environment(),
            working_dir,
            healthcheck: config.healthcheck.clone(),
        })
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, ServiceKind::Container { .. })
    }
}

/// What the service is running as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceIdentity {
    Process { pid: u32 },
    Container { id: String },
}

impl std::fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceIdentity::Process { pid } => write!(f, "pid {}", pid),
            ServiceIdentity::Container { id } => {
                write!(f, "container {}", id.chars().take(12).collect::<String>())
            }
        }
    }
}

/// A started service
#[derive(Debug)]
pub struct ServiceProcess {
    pub name: String,
    pub runtime: ServiceRuntime,
    pub port: Option<u16>,
    /// Set once a health or liveness check has passed
    pub ready: bool,
    /// Fully resolved environment the service was started with
    pub env: IndexMap<String, String>,
    pub started_at: DateTime<Local>,
    identity: ServiceIdentity,
    pub(crate) child: Option<Child>,
    pub(crate) log_tasks: Vec<JoinHandle<()>>,
}

impl ServiceProcess {
    pub(crate) fn new(
        runtime: &ServiceRuntime,
        env: IndexMap<String, String>,
        identity: ServiceIdentity,
    ) -> Self {
        Self {
            name: runtime.name.clone(),
            runtime: runtime.clone(),
            port: runtime.port,
            ready: false,
            env,
            started_at: Local::now(),
            identity,
            child: None,
            log_tasks: Vec::new(),
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn pid(&self) -> Option<u32> {
        match self.identity {
            ServiceIdentity::Process { pid } => Some(pid),
            ServiceIdentity::Container { .. } => None,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match &self.identity {
            ServiceIdentity::Container { id } => Some(id),
            ServiceIdentity::Process { .. } => None,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.identity, ServiceIdentity::Container { .. })
    }

    /// Local URL, when the service has a port
    pub fn url(&self) -> Option<String> {
        self.port.map(|p| format!("http://localhost:{}", p))
    }

    /// Stop following output
    pub(crate) fn abort_log_tasks(&mut self) {
        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }

    /// Wait for output drains to reach end of stream
    pub(crate) async fn join_log_tasks(&mut self, timeout: Duration) {
        for task in self.log_tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                abort.abort();
            }
        }
    }
}

/// Starts and stops services of either kind
pub struct ServiceController {
    containers: ContainerRunner,
    processes: ProcessRunner,
}

impl ServiceController {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            containers: ContainerRunner::new(engine),
            processes: ProcessRunner,
        }
    }

    pub fn containers(&self) -> &ContainerRunner {
        &self.containers
    }

    /// Start a service and begin draining its output into `logs`.
    ///
    /// The returned handle is not ready unless an already-running container
    /// was reused. Failing to follow a container's output is only logged.
    pub async fn start(
        &self,
        runtime: &ServiceRuntime,
        env: IndexMap<String, String>,
        restart_containers: bool,
        logs: &LogManager,
    ) -> Result<ServiceProcess, LifecycleError> {
        match runtime.kind {
            ServiceKind::Container { .. } => {
                let mut process = self
                    .containers
                    .start(runtime, env, restart_containers)
                    .await?;
                // A running container without a log tail is still usable
                match self.containers.collect_logs(&process, logs).await {
                    Ok(task) => process.log_tasks.push(task),
                    Err(e) => log::warn!("[{}] {}", runtime.name, e),
                }
                Ok(process)
            }
            ServiceKind::Process { .. } => self.processes.start(runtime, env, logs),
        }
    }

    /// Stop a service. Never fails for a container whose engine calls fail;
    /// those are logged.
    pub async fn stop(
        &self,
        process: &mut ServiceProcess,
        grace: Duration,
    ) -> Result<(), LifecycleError> {
        let result = if process.is_container() {
            self.containers.stop(process, grace).await
        } else {
            self.processes.stop(process, grace).await
        };
        process.ready = false;
        result
    }

    /// Whether the service is still running
    pub async fn is_alive(&self, process: &mut ServiceProcess) -> bool {
        if process.is_container() {
            self.containers.is_running(process.identity()).await
        } else {
            self.processes.is_running(process)
        }
    }
}

/// Errors from starting, stopping or probing a service
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Invalid service name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Container engine '{0}' is not available; is the daemon running?")]
    EngineUnavailable(String),

    #[error("Service '{0}' has neither an image nor a command")]
    MissingImage(String),

    #[error("Failed to start container for '{service}': {source}")]
    RunFailed {
        service: String,
        #[source]
        source: EngineError,
    },

    #[error("Failed to spawn process for '{service}': {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service '{0}' has no container id")]
    NoContainer(String),

    #[error("Failed to collect logs for '{service}': {reason}")]
    LogCollection { service: String, reason: String },

    #[error("Service '{service}' did not become ready: {reason}")]
    NotReady { service: String, reason: String },

    #[error("Port {port} for '{service}' is already in use")]
    PortInUse { service: String, port: u16 },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl LifecycleError {
    pub(crate) fn log_collection(service: &str, err: impl std::fmt::Display) -> Self {
        LifecycleError::LogCollection {
            service: service.to_string(),
            reason: err.to_string(),
        }
    }
}
