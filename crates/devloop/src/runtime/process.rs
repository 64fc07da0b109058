//! Process-backed services

use super::service::{LifecycleError, ServiceIdentity, ServiceKind, ServiceProcess, ServiceRuntime};
use crate::logs::{LogBuffer, LogEntry, LogManager};
use indexmap::IndexMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long to wait for output drains after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawns and stops services that run as native processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawn the service's command and drain stdout and stderr into its
    /// log buffer
    pub fn start(
        &self,
        runtime: &ServiceRuntime,
        env: IndexMap<String, String>,
        logs: &LogManager,
    ) -> Result<ServiceProcess, LifecycleError> {
        let ServiceKind::Process { command, args } = &runtime.kind else {
            return Err(LifecycleError::SpawnFailed {
                service: runtime.name.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "service has no command",
                ),
            });
        };

        if let Some(port) = runtime.port {
            if !port_available(port) {
                log::error!("[{}] Port {} is already in use", runtime.name, port);
                return Err(LifecycleError::PortInUse {
                    service: runtime.name.clone(),
                    port,
                });
            }
        }

        log::info!(
            "[{}] Starting: {} {}",
            runtime.name,
            command,
            args.join(" ")
        );

        let buffer = logs
            .create_buffer(&runtime.name)
            .map_err(|e| LifecycleError::log_collection(&runtime.name, e))?;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(&env)
            .current_dir(&runtime.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| {
            log::error!("[{}] Failed to spawn process: {}", runtime.name, source);
            LifecycleError::SpawnFailed {
                service: runtime.name.clone(),
                source,
            }
        })?;

        let pid = child.id().unwrap_or(0);
        let mut log_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(drain(stdout, Arc::clone(&buffer), false));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(drain(stderr, buffer, true));
        }

        let mut process = ServiceProcess::new(runtime, env, ServiceIdentity::Process { pid });
        process.child = Some(child);
        process.log_tasks = log_tasks;

        log::info!("[{}] Started {}", runtime.name, process.identity());
        Ok(process)
    }

    /// Stop gracefully (SIGTERM), then force kill after `grace`
    pub async fn stop(
        &self,
        process: &mut ServiceProcess,
        grace: Duration,
    ) -> Result<(), LifecycleError> {
        let Some(mut child) = process.child.take() else {
            return Ok(());
        };

        log::info!("[{}] Stopping process...", process.name);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = process.pid() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                log::info!(
                    "[{}] Process exited with code: {:?}",
                    process.name,
                    status.code()
                );
            }
            Ok(Err(e)) => {
                log::error!("[{}] Error waiting for process: {}", process.name, e);
            }
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit gracefully, forcing kill",
                    process.name
                );
                if let Err(e) = child.kill().await {
                    log::error!("[{}] Failed to kill process: {}", process.name, e);
                }
            }
        }

        process.join_log_tasks(DRAIN_TIMEOUT).await;
        Ok(())
    }

    /// Whether the child is still running. Reaps it if it has exited.
    pub fn is_running(&self, process: &mut ServiceProcess) -> bool {
        let Some(child) = process.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::info!(
                    "[{}] Process exited with code: {:?}",
                    process.name,
                    status.code()
                );
                process.child = None;
                false
            }
            Err(e) => {
                log::error!("[{}] Error checking process status: {}", process.name, e);
                false
            }
        }
    }
}

/// Whether `port` can be bound on all interfaces. The listener is released
/// before returning.
pub fn port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

fn drain<R>(stream: R, buffer: Arc<LogBuffer>, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer.add(LogEntry::new(buffer.service(), line, is_stderr));
        }
    })
}
