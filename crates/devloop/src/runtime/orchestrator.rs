//! Orchestrator - level-by-level startup and reverse-order shutdown

use crate::config::{
    load_dotenv_if_exists, mask_secrets, service_bindings, EnvironmentError, EnvironmentResolver,
    Manifest, DOTENV_FILE,
};
use crate::logs::{LogConfig, LogManager};
use crate::runtime::dependency::{DependencyError, DependencyGraph};
use crate::runtime::engine::ContainerEngine;
use crate::runtime::health::{HealthCheck, DEFAULT_HEALTH_TIMEOUT};
use crate::runtime::service::{
    LifecycleError, ServiceController, ServiceKind, ServiceProcess, ServiceRuntime,
};
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Project root; relative working directories and log files live here
    pub project_dir: PathBuf,
    /// Replace running containers instead of reusing them
    pub restart_containers: bool,
    /// Time allowed for every service of one level to start
    pub start_timeout: Duration,
    /// Readiness deadline for services without `timeout_secs`
    pub health_timeout: Duration,
    /// Grace period per service on shutdown
    pub stop_timeout: Duration,
    /// Variables layered over the OS environment
    pub extra_env: IndexMap<String, String>,
    /// `.env` file; defaults to `<project_dir>/.env` when present
    pub env_file: Option<PathBuf>,
    /// Services to run with their dependencies (empty = all)
    pub services: Vec<String>,
    /// Extra log filter patterns, added to the manifest's `logs.filters`
    pub log_exclude: Vec<String>,
    /// Log buffer settings. A `filter` set here replaces the manifest's.
    pub log: LogConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            project_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            restart_containers: false,
            start_timeout: Duration::from_secs(120),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            stop_timeout: Duration::from_secs(10),
            extra_env: IndexMap::new(),
            env_file: None,
            services: Vec::new(),
            log_exclude: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

/// Runs the services of one manifest
pub struct Orchestrator {
    config: OrchestratorConfig,
    manifest: Manifest,
    controller: Arc<ServiceController>,
    logs: Arc<LogManager>,
    resolver: EnvironmentResolver,
    graph: Option<DependencyGraph>,
    processes: IndexMap<String, ServiceProcess>,
}

/// Launch plan for dry-run mode
#[derive(Debug, Serialize)]
pub struct LaunchPlan {
    pub name: Option<String>,
    /// Services grouped by startup level
    pub levels: Vec<Vec<LaunchPlanService>>,
    /// Resources services depend on; never started
    pub resources: Vec<String>,
}

/// A service in the launch plan
#[derive(Debug, Serialize)]
pub struct LaunchPlanService {
    pub name: String,
    #[serde(flatten)]
    pub kind: ServiceKind,
    pub port: Option<u16>,
    pub dependencies: Vec<String>,
    /// Declared environment with secrets masked
    pub env: IndexMap<String, String>,
}

/// Runtime state of one started service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub identity: String,
    pub ready: bool,
    pub alive: bool,
    pub url: Option<String>,
    pub started_at: DateTime<Local>,
}

impl Orchestrator {
    /// Create an orchestrator. Environment files are read here so a bad
    /// `--env-file` fails before anything starts.
    pub fn new(
        manifest: Manifest,
        config: OrchestratorConfig,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self, OrchestratorError> {
        let mut log_config = config.log.clone();
        if log_config.filter.is_none() {
            let filter = manifest.logs.build_filter(&config.log_exclude)?;
            log::debug!("Filtering log lines with {} patterns", filter.len());
            log_config.filter = Some(Arc::new(filter));
        }
        let logs = Arc::new(LogManager::new(&config.project_dir, log_config));

        let mut resolver = EnvironmentResolver::new(&config.extra_env, config.env_file.as_deref())?;
        if config.env_file.is_none() {
            resolver.extend(load_dotenv_if_exists(logs.project_dir(), DOTENV_FILE)?);
        }

        Ok(Self {
            config,
            manifest,
            controller: Arc::new(ServiceController::new(engine)),
            logs,
            resolver,
            graph: None,
            processes: IndexMap::new(),
        })
    }

    pub fn logs(&self) -> &Arc<LogManager> {
        &self.logs
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Dependency graph, narrowed to the selected services
    pub fn graph(&self) -> Result<DependencyGraph, OrchestratorError> {
        let graph = DependencyGraph::build(&self.manifest)?;
        if self.config.services.is_empty() {
            Ok(graph)
        } else {
            Ok(graph.filter(&self.config.services)?)
        }
    }

    /// Generate a launch plan (for dry-run mode)
    pub fn plan(&self) -> Result<LaunchPlan, OrchestratorError> {
        let graph = self.graph()?;
        let project_dir = self.logs.project_dir();

        let mut levels = Vec::new();
        for level in graph.levels() {
            let mut services = Vec::with_capacity(level.len());
            for name in level {
                let runtime = self.runtime(&name, project_dir)?;
                services.push(LaunchPlanService {
                    dependencies: graph
                        .dependencies(&name)
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    name,
                    kind: runtime.kind,
                    port: runtime.port,
                    env: mask_secrets(&runtime.env),
                });
            }
            levels.push(services);
        }

        let resources = graph
            .nodes()
            .filter(|n| n.is_resource)
            .map(|n| n.name.clone())
            .collect();

        Ok(LaunchPlan {
            name: self.manifest.name.clone(),
            levels,
            resources,
        })
    }

    fn runtime(
        &self,
        name: &str,
        project_dir: &std::path::Path,
    ) -> Result<ServiceRuntime, OrchestratorError> {
        let config = self
            .manifest
            .services
            .get(name)
            .ok_or_else(|| DependencyError::UnknownService(name.to_string()))?;
        ServiceRuntime::from_config(name, config, project_dir).map_err(|source| {
            OrchestratorError::Service {
                service: name.to_string(),
                source,
            }
        })
    }

    /// Start every service level by level.
    ///
    /// Services of a level start concurrently with the environment bindings
    /// of everything already ready. A level must be fully ready before the
    /// next one starts. On error, services started so far keep running;
    /// call [`Orchestrator::stop_all`] to clean up.
    pub async fn start_all(
        &mut self,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        let graph = self.graph()?;
        let levels = graph.levels();
        let project_dir = self.logs.project_dir().to_path_buf();

        let runtimes: HashMap<String, ServiceRuntime> = levels
            .iter()
            .flatten()
            .map(|name| {
                self.runtime(name, &project_dir)
                    .map(|runtime| (name.clone(), runtime))
            })
            .collect::<Result<_, OrchestratorError>>()?;

        self.graph = Some(graph);

        let total: usize = levels.iter().map(Vec::len).sum();
        log::info!("Starting {} services in {} levels...", total, levels.len());

        for (index, level) in levels.iter().enumerate() {
            if shutdown_rx.has_changed().unwrap_or(false) {
                log::info!("Shutdown requested, aborting launch");
                return Err(OrchestratorError::Aborted);
            }

            log::info!("Level {}: {}", index, level.join(", "));
            self.start_level(index, level, &runtimes, &mut shutdown_rx)
                .await?;
            self.await_level_ready(level, &shutdown_rx).await?;
        }

        log::info!("All services started successfully");
        Ok(())
    }

    async fn start_level(
        &mut self,
        index: usize,
        level: &[String],
        runtimes: &HashMap<String, ServiceRuntime>,
        shutdown_rx: &mut watch::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        let bindings = service_bindings(self.processes.values());
        let mut tasks = JoinSet::new();

        for name in level {
            let Some(runtime) = runtimes.get(name).cloned() else {
                continue;
            };
            let env = self.resolver.resolve(&runtime, &bindings);
            let controller = Arc::clone(&self.controller);
            let logs = Arc::clone(&self.logs);
            let restart = self.config.restart_containers;

            tasks.spawn(async move {
                let result = controller.start(&runtime, env, restart, &logs).await;
                (runtime.name, result)
            });
        }

        let deadline = Instant::now() + self.config.start_timeout;
        let mut failure = None;

        loop {
            let joined = tokio::select! {
                joined = tokio::time::timeout_at(deadline, tasks.join_next()) => joined,
                _ = shutdown_requested(shutdown_rx) => {
                    log::info!("Shutdown requested, aborting level {}", index);
                    failure.get_or_insert(OrchestratorError::Aborted);
                    break;
                }
            };

            match joined {
                Ok(Some(Ok((name, Ok(process))))) => {
                    self.processes.insert(name, process);
                }
                Ok(Some(Ok((name, Err(source))))) => {
                    log::error!("[{}] Failed to start: {}", name, source);
                    failure.get_or_insert(OrchestratorError::Service {
                        service: name,
                        source,
                    });
                }
                Ok(Some(Err(e))) => {
                    failure.get_or_insert(OrchestratorError::Task(e.to_string()));
                }
                Ok(None) => break,
                Err(_) => {
                    failure.get_or_insert(OrchestratorError::LevelTimeout {
                        level: index,
                        timeout: self.config.start_timeout,
                    });
                    break;
                }
            }
        }

        if failure.is_some() {
            // Keep whatever finished before the abort so stop_all can clean it up
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, Ok(process))) = joined {
                    self.processes.insert(name, process);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn await_level_ready(
        &mut self,
        level: &[String],
        shutdown_rx: &watch::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        let mut tasks = JoinSet::new();

        for name in level {
            let Some(mut process) = self.processes.shift_remove(name) else {
                continue;
            };
            let controller = Arc::clone(&self.controller);
            let logs = Arc::clone(&self.logs);
            let check = HealthCheck::for_service(&process.runtime, self.config.health_timeout);
            let mut shutdown_rx = shutdown_rx.clone();

            // The probe is cancelled on shutdown, but the handle always comes
            // back so the service can still be stopped
            tasks.spawn(async move {
                let result = if process.ready {
                    Some(Ok(()))
                } else {
                    tokio::select! {
                        result = check.wait_until_ready(&mut process, &controller, &logs) => Some(result),
                        _ = shutdown_requested(&mut shutdown_rx) => None,
                    }
                };
                (process, result)
            });
        }

        let mut failure = None;
        let mut aborted = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((process, result)) => {
                    match result {
                        Some(Ok(())) => {}
                        Some(Err(source)) => {
                            log::error!("[{}] {}", process.name, source);
                            failure.get_or_insert(OrchestratorError::Service {
                                service: process.name.clone(),
                                source,
                            });
                        }
                        None => aborted = true,
                    }
                    self.processes.insert(process.name.clone(), process);
                }
                Err(e) => {
                    failure.get_or_insert(OrchestratorError::Task(e.to_string()));
                }
            }
        }

        if aborted {
            log::info!("Shutdown requested, readiness checks cancelled");
            return Err(OrchestratorError::Aborted);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait until shutdown is requested or every service has exited
    pub async fn wait(&mut self, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::info!("Shutdown signal received");
                    break;
                }

                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let mut any_alive = false;
                    for process in self.processes.values_mut() {
                        if self.controller.is_alive(process).await {
                            any_alive = true;
                        }
                    }
                    if !any_alive {
                        log::info!("All services have stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Stop every service in reverse dependency order, then close all log
    /// buffers
    pub async fn stop_all(&mut self) {
        log::info!("Stopping all services...");

        for level in self.shutdown_order() {
            let mut tasks = JoinSet::new();
            for name in level {
                let Some(mut process) = self.processes.shift_remove(&name) else {
                    continue;
                };
                let controller = Arc::clone(&self.controller);
                let grace = self.config.stop_timeout;
                tasks.spawn(async move {
                    if let Err(e) = controller.stop(&mut process, grace).await {
                        log::error!("[{}] Error stopping service: {}", process.name, e);
                    }
                });
            }
            while tasks.join_next().await.is_some() {}
        }

        if let Err(e) = self.logs.close_all() {
            log::warn!("Failed to close log buffers: {}", e);
        }

        log::info!("All services stopped");
    }

    /// Graph shutdown levels, preceded by anything started outside the graph
    fn shutdown_order(&self) -> Vec<Vec<String>> {
        let mut order = self
            .graph
            .as_ref()
            .map(DependencyGraph::shutdown_order)
            .unwrap_or_default();

        let known: HashSet<&String> = order.iter().flatten().collect();
        let extra: Vec<String> = self
            .processes
            .keys()
            .rev()
            .filter(|name| !known.contains(name))
            .cloned()
            .collect();
        if !extra.is_empty() {
            order.insert(0, extra);
        }
        order
    }

    /// `name -> url` for every ready service with a port
    pub fn service_urls(&self) -> IndexMap<String, String> {
        self.processes
            .values()
            .filter(|p| p.ready)
            .filter_map(|p| p.url().map(|url| (p.name.clone(), url)))
            .collect()
    }

    pub fn process(&self, name: &str) -> Option<&ServiceProcess> {
        self.processes.get(name)
    }

    /// Snapshot of every started service, checking liveness
    pub async fn status(&mut self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(self.processes.len());
        for process in self.processes.values_mut() {
            let alive = self.controller.is_alive(process).await;
            statuses.push(ServiceStatus {
                name: process.name.clone(),
                identity: process.identity().to_string(),
                ready: process.ready,
                alive,
                url: process.url(),
                started_at: process.started_at,
            });
        }
        statuses
    }
}

/// Resolves once a shutdown is signalled. A dropped sender means no
/// shutdown can arrive any more, so this then never resolves.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<()>) {
    if shutdown_rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Errors that can occur while orchestrating services
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Service '{service}' failed: {source}")]
    Service {
        service: String,
        #[source]
        source: LifecycleError,
    },

    #[error("Level {level} did not start within {timeout:?}")]
    LevelTimeout { level: usize, timeout: Duration },

    #[error("Start task failed: {0}")]
    Task(String),

    #[error("Launch aborted by shutdown request")]
    Aborted,

    #[error("Invalid log filter: {0}")]
    LogFilter(#[from] regex::Error),
}

/// Display the launch plan in a human-readable format
impl std::fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        if let Some(name) = &self.name {
            writeln!(f, "Project: {}", name)?;
        }
        writeln!(f)?;

        if !self.resources.is_empty() {
            writeln!(f, "Resources (not started): {}", self.resources.join(", "))?;
            writeln!(f)?;
        }

        for (i, level) in self.levels.iter().enumerate() {
            writeln!(f, "Level {}:", i)?;
            for service in level {
                let port = service
                    .port
                    .map(|p| format!(" :{}", p))
                    .unwrap_or_default();
                match &service.kind {
                    ServiceKind::Container { image } => {
                        writeln!(f, "  {}{} [container] {}", service.name, port, image)?
                    }
                    ServiceKind::Process { command, args } => writeln!(
                        f,
                        "  {}{} [process] {} {}",
                        service.name,
                        port,
                        command,
                        args.join(" ")
                    )?,
                }

                if !service.dependencies.is_empty() {
                    writeln!(f, "     Depends on: {}", service.dependencies.join(", "))?;
                }
                for (key, value) in &service.env {
                    writeln!(f, "     {}={}", key, value)?;
                }
            }
            writeln!(f)?;
        }

        Ok(())
    }
}
