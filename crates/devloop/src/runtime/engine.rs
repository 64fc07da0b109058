//! Container engine client
//!
//! [`ContainerEngine`] is the contract the lifecycle controller talks to.
//! [`DockerCli`] implements it by shelling out to `docker` (or any
//! CLI-compatible engine such as `podman`); [`mock::MockEngine`] keeps
//! everything in memory for tests.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Default timeout for short engine commands (inspect, rm, run)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for image pulls
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Buffer size of the in-process pipe carrying merged container output
const LOG_PIPE_CAPACITY: usize = 64 * 1024;

/// Combined container output, one line per log line
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Settings for `run`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// Published ports in `host:container/proto` form
    pub ports: Vec<String>,
    pub env: IndexMap<String, String>,
}

/// What `inspect_by_name` reports about an existing container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

/// Operations the lifecycle controller needs from a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for log messages
    fn name(&self) -> &str;

    /// Whether the engine daemon is reachable
    async fn is_available(&self) -> bool;

    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Create and start a detached container, returning its id
    async fn run(&self, config: &ContainerConfig) -> Result<String, EngineError>;

    /// Graceful stop, killing after `timeout`
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Forced removal
    async fn remove(&self, id: &str) -> Result<(), EngineError>;

    /// False for unknown ids and on any engine failure
    async fn is_running(&self, id: &str) -> bool;

    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// Follow the container's stdout and stderr as one line stream
    async fn logs(&self, id: &str) -> Result<LogStream, EngineError>;
}

/// Docker-compatible CLI engine
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    command_timeout: Duration,
    pull_timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, command: Duration, pull: Duration) -> Self {
        self.command_timeout = command;
        self.pull_timeout = pull;
        self
    }

    /// Run one CLI command to completion and return trimmed stdout
    async fn exec(&self, args: &[String], timeout: Duration) -> Result<String, EngineError> {
        let operation = args.first().cloned().unwrap_or_default();
        log::debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::Unavailable(format!(
                    "'{}' not found in PATH",
                    self.binary
                )));
            }
            Ok(Err(e)) => return Err(EngineError::Io(e)),
            Err(_) => return Err(EngineError::Timeout { operation, timeout }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(EngineError::CommandFailed {
            command: format!("{} {}", self.binary, operation),
            stderr,
        })
    }

    fn run_args(config: &ContainerConfig) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            config.name.clone(),
        ];
        for port in &config.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(config.image.clone());
        args
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn is_available(&self) -> bool {
        let args = ["info".to_string(), "--format".to_string(), "{{.ServerVersion}}".to_string()];
        match self.exec(&args, self.command_timeout).await {
            Ok(version) => {
                log::debug!("{} server version {}", self.binary, version);
                true
            }
            Err(e) => {
                log::debug!("{} is not available: {}", self.binary, e);
                false
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        let args = ["pull".to_string(), image.to_string()];
        self.exec(&args, self.pull_timeout).await.map(|_| ())
    }

    async fn run(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        match self.exec(&Self::run_args(config), self.command_timeout).await {
            Ok(id) => Ok(id),
            Err(EngineError::CommandFailed { stderr, .. }) if stderr.contains("is already in use") => {
                Err(EngineError::NameConflict(config.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            id.to_string(),
        ];
        // The engine kills the container itself once the grace period ends
        self.exec(&args, timeout + self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let args = ["rm".to_string(), "-f".to_string(), id.to_string()];
        self.exec(&args, self.command_timeout).await.map(|_| ())
    }

    async fn is_running(&self, id: &str) -> bool {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            id.to_string(),
        ];
        matches!(self.exec(&args, self.command_timeout).await.as_deref(), Ok("true"))
    }

    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let args = [
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{.Id}}|{{.Config.Image}}|{{.State.Running}}".to_string(),
            name.to_string(),
        ];
        let out = match self.exec(&args, self.command_timeout).await {
            Ok(out) => out,
            Err(EngineError::CommandFailed { stderr, .. })
                if stderr.to_lowercase().contains("no such") =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut parts = out.splitn(3, '|');
        let id = parts.next().unwrap_or_default().to_string();
        let image = parts.next().unwrap_or_default().to_string();
        let running = parts.next() == Some("true");
        if id.is_empty() {
            return Ok(None);
        }

        Ok(Some(ContainerInfo {
            id,
            name: name.to_string(),
            image,
            running,
        }))
    }

    async fn logs(&self, id: &str) -> Result<LogStream, EngineError> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(EngineError::Io(std::io::Error::other(
                "log pipes were not captured",
            )));
        };

        let (mut writer, reader) = tokio::io::duplex(LOG_PIPE_CAPACITY);

        // Whole lines from both streams are interleaved into one pipe. The
        // child is dropped (and killed) once the reader side goes away.
        tokio::spawn(async move {
            let _child = child;
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let mut out_done = false;
            let mut err_done = false;

            while !(out_done && err_done) {
                let line = tokio::select! {
                    line = out.next_line(), if !out_done => match line {
                        Ok(Some(line)) => line,
                        _ => {
                            out_done = true;
                            continue;
                        }
                    },
                    line = err.next_line(), if !err_done => match line {
                        Ok(Some(line)) => line,
                        _ => {
                            err_done = true;
                            continue;
                        }
                    },
                };

                if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(reader))
    }
}

/// Errors reported by a container engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    #[error("Container name '{0}' is already in use")]
    NameConflict(String),

    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Engine operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-memory engine for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard};

    #[derive(Debug, Clone)]
    pub struct MockContainer {
        pub id: String,
        pub image: String,
        pub running: bool,
        pub config: ContainerConfig,
    }

    /// Records every call; containers are keyed by name
    #[derive(Default)]
    pub struct MockEngine {
        pub available: AtomicBool,
        pub fail_pull: AtomicBool,
        pub fail_logs: AtomicBool,
        containers: Mutex<HashMap<String, MockContainer>>,
        log_lines: Mutex<HashMap<String, Vec<String>>>,
        calls: Mutex<Vec<String>>,
        stop_timeouts: Mutex<Vec<Duration>>,
        next_id: AtomicUsize,
    }

    impl MockEngine {
        pub fn new() -> Self {
            let engine = Self::default();
            engine.available.store(true, Ordering::SeqCst);
            engine
        }

        pub fn unavailable() -> Self {
            Self::default()
        }

        /// Pre-create a container, as if left over from an earlier run
        pub fn add_container(&self, name: &str, image: &str, running: bool) -> String {
            let id = self.allocate_id();
            lock(&self.containers).insert(
                name.to_string(),
                MockContainer {
                    id: id.clone(),
                    image: image.to_string(),
                    running,
                    config: ContainerConfig {
                        name: name.to_string(),
                        image: image.to_string(),
                        ..Default::default()
                    },
                },
            );
            id
        }

        /// Lines served by `logs` for the named container
        pub fn set_logs(&self, name: &str, lines: &[&str]) {
            lock(&self.log_lines).insert(
                name.to_string(),
                lines.iter().map(|l| l.to_string()).collect(),
            );
        }

        pub fn container(&self, name: &str) -> Option<MockContainer> {
            lock(&self.containers).get(name).cloned()
        }

        /// Calls recorded as `"<op> <arg>"`
        pub fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }

        /// Grace periods passed to `stop`, in call order
        pub fn stop_timeouts(&self) -> Vec<Duration> {
            lock(&self.stop_timeouts).clone()
        }

        pub fn count(&self, op: &str) -> usize {
            lock(&self.calls)
                .iter()
                .filter(|c| c.split(' ').next() == Some(op))
                .count()
        }

        fn record(&self, op: &str, arg: &str) {
            lock(&self.calls).push(format!("{} {}", op, arg));
        }

        fn allocate_id(&self) -> String {
            format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn find_by_id(&self, id: &str) -> Option<String> {
            lock(&self.containers)
                .iter()
                .find(|(_, c)| c.id == id)
                .map(|(name, _)| name.clone())
        }
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[async_trait]
    impl ContainerEngine for MockEngine {
        fn name(&self) -> &str {
            "mock"
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn pull(&self, image: &str) -> Result<(), EngineError> {
            self.record("pull", image);
            if self.fail_pull.load(Ordering::SeqCst) {
                return Err(EngineError::CommandFailed {
                    command: "mock pull".to_string(),
                    stderr: format!("manifest for {} not found", image),
                });
            }
            Ok(())
        }

        async fn run(&self, config: &ContainerConfig) -> Result<String, EngineError> {
            self.record("run", &config.name);
            let mut containers = lock(&self.containers);
            if containers.contains_key(&config.name) {
                return Err(EngineError::NameConflict(config.name.clone()));
            }
            let id = self.allocate_id();
            containers.insert(
                config.name.clone(),
                MockContainer {
                    id: id.clone(),
                    image: config.image.clone(),
                    running: true,
                    config: config.clone(),
                },
            );
            Ok(id)
        }

        async fn stop(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
            self.record("stop", id);
            lock(&self.stop_timeouts).push(timeout);
            let mut containers = lock(&self.containers);
            match containers.values_mut().find(|c| c.id == id) {
                Some(container) => {
                    container.running = false;
                    Ok(())
                }
                None => Err(EngineError::CommandFailed {
                    command: "mock stop".to_string(),
                    stderr: format!("No such container: {}", id),
                }),
            }
        }

        async fn remove(&self, id: &str) -> Result<(), EngineError> {
            self.record("remove", id);
            let mut containers = lock(&self.containers);
            let before = containers.len();
            containers.retain(|_, c| c.id != id);
            if containers.len() == before {
                return Err(EngineError::CommandFailed {
                    command: "mock rm".to_string(),
                    stderr: format!("No such container: {}", id),
                });
            }
            Ok(())
        }

        async fn is_running(&self, id: &str) -> bool {
            lock(&self.containers)
                .values()
                .any(|c| c.id == id && c.running)
        }

        async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
            self.record("inspect", name);
            Ok(lock(&self.containers).get(name).map(|c| ContainerInfo {
                id: c.id.clone(),
                name: name.to_string(),
                image: c.image.clone(),
                running: c.running,
            }))
        }

        async fn logs(&self, id: &str) -> Result<LogStream, EngineError> {
            self.record("logs", id);
            if self.fail_logs.load(Ordering::SeqCst) {
                return Err(EngineError::CommandFailed {
                    command: "mock logs".to_string(),
                    stderr: "log driver does not support reading".to_string(),
                });
            }
            let name = self.find_by_id(id).ok_or_else(|| EngineError::CommandFailed {
                command: "mock logs".to_string(),
                stderr: format!("No such container: {}", id),
            })?;
            let mut text = String::new();
            for line in lock(&self.log_lines).get(&name).into_iter().flatten() {
                text.push_str(line);
                text.push('\n');
            }
            Ok(Box::new(std::io::Cursor::new(text.into_bytes())))
        }
    }
}
