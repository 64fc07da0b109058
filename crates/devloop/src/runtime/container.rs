//! Container-backed services

use super::engine::{ContainerConfig, ContainerEngine, EngineError};
use super::service::{LifecycleError, ServiceIdentity, ServiceKind, ServiceProcess, ServiceRuntime};
use crate::logs::{LogEntry, LogManager};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

/// Prefix of every container this tool creates
pub const CONTAINER_PREFIX: &str = "devloop-";

/// Maximum service name length usable in a container name
pub const MAX_SERVICE_NAME_LEN: usize = 64;

/// Grace period used when the caller passes less than a second
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Grace period for clearing a stale container before a retry
const STALE_STOP_GRACE: Duration = Duration::from_secs(5);

static SERVICE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").unwrap());

/// Check that a service name is safe to embed in a container name
pub fn validate_service_name(name: &str) -> Result<(), LifecycleError> {
    let invalid = |reason: &str| LifecycleError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(invalid(&format!(
            "name exceeds {} characters",
            MAX_SERVICE_NAME_LEN
        )));
    }
    if !SERVICE_NAME.is_match(name) {
        return Err(invalid(
            "must start with a letter and contain only letters, digits, '_' or '-'",
        ));
    }
    Ok(())
}

/// Container name derived from a service name
pub fn container_name(service: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, service)
}

/// Starts, stops and follows services that run in containers
pub struct ContainerRunner {
    engine: Arc<dyn ContainerEngine>,
}

impl ContainerRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Start the service's container.
    ///
    /// Unless `restart` is set, a running container with the derived name is
    /// reused and returned ready. A name clash with a stale container is
    /// resolved by removing it and retrying once.
    pub async fn start(
        &self,
        runtime: &ServiceRuntime,
        env: IndexMap<String, String>,
        restart: bool,
    ) -> Result<ServiceProcess, LifecycleError> {
        validate_service_name(&runtime.name)?;

        let ServiceKind::Container { image } = &runtime.kind else {
            return Err(LifecycleError::MissingImage(runtime.name.clone()));
        };
        if image.trim().is_empty() {
            return Err(LifecycleError::MissingImage(runtime.name.clone()));
        }

        if !self.engine.is_available().await {
            return Err(LifecycleError::EngineUnavailable(
                self.engine.name().to_string(),
            ));
        }

        log::info!(
            "[{}] Starting container: image={} port={:?}",
            runtime.name,
            image,
            runtime.port
        );

        if let Err(e) = self.engine.pull(image).await {
            log::warn!(
                "[{}] Failed to pull {} (continuing with cached image): {}",
                runtime.name,
                image,
                e
            );
        }

        let name = container_name(&runtime.name);

        if !restart {
            match self.engine.inspect_by_name(&name).await {
                Ok(Some(info)) if self.engine.is_running(&info.id).await => {
                    log::info!(
                        "[{}] Reusing running container {}",
                        runtime.name,
                        name
                    );
                    let mut process =
                        ServiceProcess::new(runtime, env, ServiceIdentity::Container { id: info.id });
                    process.ready = true;
                    return Ok(process);
                }
                Ok(_) => {}
                Err(e) => log::debug!("[{}] Inspect of {} failed: {}", runtime.name, name, e),
            }
        }

        let config = ContainerConfig {
            name: name.clone(),
            image: image.clone(),
            ports: runtime
                .port
                .map(|p| vec![format!("{}:{}/tcp", p, p)])
                .unwrap_or_default(),
            env: env.clone(),
        };

        let id = match self.engine.run(&config).await {
            Ok(id) => id,
            Err(EngineError::NameConflict(_)) => {
                log::info!("[{}] Removing existing container {}", runtime.name, name);
                self.clear_stale(&name).await;
                self.engine
                    .run(&config)
                    .await
                    .map_err(|source| LifecycleError::RunFailed {
                        service: runtime.name.clone(),
                        source,
                    })?
            }
            Err(source) => {
                return Err(LifecycleError::RunFailed {
                    service: runtime.name.clone(),
                    source,
                });
            }
        };

        let process = ServiceProcess::new(runtime, env, ServiceIdentity::Container { id });
        log::info!("[{}] Started {}", runtime.name, process.identity());
        Ok(process)
    }

    async fn clear_stale(&self, name: &str) {
        let id = match self.engine.inspect_by_name(name).await {
            Ok(Some(info)) => info.id,
            _ => name.to_string(),
        };
        if let Err(e) = self.engine.stop(&id, STALE_STOP_GRACE).await {
            log::debug!("Failed to stop stale container {}: {}", name, e);
        }
        if let Err(e) = self.engine.remove(&id).await {
            log::debug!("Failed to remove stale container {}: {}", name, e);
        }
    }

    /// Stop and remove the service's container. Engine failures are logged
    /// and do not abort the sequence.
    pub async fn stop(
        &self,
        process: &mut ServiceProcess,
        grace: Duration,
    ) -> Result<(), LifecycleError> {
        let id = process
            .container_id()
            .ok_or_else(|| LifecycleError::NoContainer(process.name.clone()))?
            .to_string();

        let grace = if grace < Duration::from_secs(1) {
            DEFAULT_STOP_GRACE
        } else {
            grace
        };

        log::info!("[{}] Stopping {}", process.name, process.identity());

        if let Err(e) = self.engine.stop(&id, grace).await {
            log::warn!("[{}] Failed to stop container gracefully: {}", process.name, e);
        }
        if let Err(e) = self.engine.remove(&id).await {
            log::warn!("[{}] Failed to remove container: {}", process.name, e);
        }

        process.abort_log_tasks();
        log::info!("[{}] Container stopped", process.name);
        Ok(())
    }

    /// Follow the container's output into its log buffer
    pub async fn collect_logs(
        &self,
        process: &ServiceProcess,
        logs: &LogManager,
    ) -> Result<JoinHandle<()>, LifecycleError> {
        let id = process
            .container_id()
            .ok_or_else(|| LifecycleError::NoContainer(process.name.clone()))?;

        let buffer = logs
            .create_buffer(&process.name)
            .map_err(|e| LifecycleError::log_collection(&process.name, e))?;
        let stream = self
            .engine
            .logs(id)
            .await
            .map_err(|e| LifecycleError::log_collection(&process.name, e))?;

        let service = process.name.clone();
        Ok(tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => buffer.add(LogEntry::new(&service, line, false)),
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("[{}] Container log stream ended: {}", service, e);
                        break;
                    }
                }
            }
        }))
    }

    /// False for processes and for containers that are gone
    pub async fn is_running(&self, identity: &ServiceIdentity) -> bool {
        match identity {
            ServiceIdentity::Container { id } => self.engine.is_running(id).await,
            ServiceIdentity::Process { .. } => false,
        }
    }
}
