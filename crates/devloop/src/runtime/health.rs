//! Readiness probing

use super::service::{LifecycleError, ServiceController, ServiceProcess, ServiceRuntime};
use crate::config::HealthCheckType;
use crate::logs::LogManager;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Deadline used when a service does not set `timeout_secs`
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(60);

/// First delay between probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound for the exponential backoff between probes
pub const MAX_PROBE_BACKOFF: Duration = Duration::from_secs(2);

/// Timeout of a single TCP connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout of a single HTTP readiness request
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Path requested by `http` probes that do not set one
pub const DEFAULT_HTTP_PATH: &str = "/";

/// What has to succeed for a service to count as ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// HEAD, then GET, on `http://localhost:<port><path>` answers 2xx or 3xx
    Http { port: u16, path: String },
    /// TCP connect to 127.0.0.1
    Port(u16),
    /// Substring of any collected log line
    Log(String),
    /// Process or container is alive
    Process,
    /// Ready once started
    None,
}

/// Probe plus timing for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub probe: Probe,
    pub timeout: Duration,
    pub interval: Duration,
}

impl HealthCheck {
    /// Build from the service's `healthcheck` section.
    ///
    /// Without an explicit type, services with a port get an HTTP probe on
    /// that port and everything else is checked for liveness only.
    pub fn for_service(runtime: &ServiceRuntime, default_timeout: Duration) -> Self {
        let config = &runtime.healthcheck;
        let port = config.port.or(runtime.port);

        let probe = match (config.check_type, port) {
            (Some(HealthCheckType::Http), Some(port)) | (None, Some(port)) => Probe::Http {
                port,
                path: normalize_path(config.path.as_deref()),
            },
            (Some(HealthCheckType::Port), Some(port)) => Probe::Port(port),
            (Some(HealthCheckType::Log), _) => match &config.pattern {
                Some(pattern) if !pattern.is_empty() => Probe::Log(pattern.clone()),
                _ => Probe::Process,
            },
            (Some(HealthCheckType::None), _) => Probe::None,
            (Some(HealthCheckType::Port | HealthCheckType::Http), None)
            | (Some(HealthCheckType::Process), _)
            | (None, None) => Probe::Process,
        };

        Self {
            probe,
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            interval: config
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_INTERVAL)
                .max(Duration::from_millis(1)),
        }
    }

    /// Probe until the service is ready, it dies, or the deadline passes.
    /// Marks the handle ready on success.
    pub async fn wait_until_ready(
        &self,
        process: &mut ServiceProcess,
        controller: &ServiceController,
        logs: &LogManager,
    ) -> Result<(), LifecycleError> {
        if self.probe == Probe::None {
            process.ready = true;
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        let mut delay = self.interval;
        let client = match self.probe {
            Probe::Http { .. } => Some(http_client()?),
            _ => None,
        };

        loop {
            if !controller.is_alive(process).await {
                return Err(LifecycleError::NotReady {
                    service: process.name.clone(),
                    reason: "exited before becoming ready".to_string(),
                });
            }

            if self.probe_once(&process.name, logs, client.as_ref()).await {
                log::info!("[{}] Ready", process.name);
                process.ready = true;
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::NotReady {
                    service: process.name.clone(),
                    reason: format!("{:?} did not pass within {:?}", self.probe, self.timeout),
                });
            }

            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_PROBE_BACKOFF);
        }
    }

    async fn probe_once(
        &self,
        service: &str,
        logs: &LogManager,
        client: Option<&reqwest::Client>,
    ) -> bool {
        match &self.probe {
            Probe::Http { port, path } => match client {
                Some(client) => http_ok(client, *port, path).await,
                None => false,
            },
            Probe::Port(port) => port_open(*port).await,
            Probe::Log(pattern) => logs
                .buffer(service)
                .is_some_and(|buffer| buffer.contains(pattern)),
            Probe::Process | Probe::None => true,
        }
    }
}

fn normalize_path(path: Option<&str>) -> String {
    match path {
        None | Some("") => DEFAULT_HTTP_PATH.to_string(),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
    }
}

/// Client for readiness requests. Redirects are not followed so a 3xx
/// answer counts as ready on its own.
pub fn http_client() -> Result<reqwest::Client, LifecycleError> {
    reqwest::Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| LifecycleError::HttpClient(e.to_string()))
}

/// Whether `http://localhost:<port><path>` answers with a 2xx or 3xx
/// status. Servers that reject HEAD get a GET.
pub async fn http_ok(client: &reqwest::Client, port: u16, path: &str) -> bool {
    let url = format!("http://localhost:{}{}", port, path);
    let accepted = |status: reqwest::StatusCode| (200..400).contains(&status.as_u16());

    match client.head(&url).send().await {
        Ok(response) if accepted(response.status()) => return true,
        Ok(response) => log::debug!("HEAD {} -> {}", url, response.status()),
        Err(e) => log::debug!("HEAD {} failed: {}", url, e),
    }
    match client.get(&url).send().await {
        Ok(response) => accepted(response.status()),
        Err(e) => {
            log::debug!("GET {} failed: {}", url, e);
            false
        }
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`
pub async fn port_open(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckConfig, ServiceConfig};
    use crate::logs::LogConfig;
    use crate::runtime::engine::mock::MockEngine;
    use indexmap::IndexMap;
    use std::path::Path;
    use std::sync::Arc;

    fn runtime(port: Option<u16>, healthcheck: HealthCheckConfig) -> ServiceRuntime {
        let config = ServiceConfig {
            command: Some("sh".to_string()),
            port,
            healthcheck,
            ..Default::default()
        };
        ServiceRuntime::from_config("svc", &config, Path::new(".")).unwrap()
    }

    #[test]
    fn test_default_probe() {
        let check = HealthCheck::for_service(
            &runtime(Some(8080), HealthCheckConfig::default()),
            DEFAULT_HEALTH_TIMEOUT,
        );
        assert_eq!(
            check.probe,
            Probe::Http {
                port: 8080,
                path: "/".to_string()
            }
        );
        assert_eq!(check.timeout, DEFAULT_HEALTH_TIMEOUT);
        assert_eq!(check.interval, DEFAULT_PROBE_INTERVAL);

        let check =
            HealthCheck::for_service(&runtime(None, HealthCheckConfig::default()), DEFAULT_HEALTH_TIMEOUT);
        assert_eq!(check.probe, Probe::Process);
    }

    #[test]
    fn test_explicit_probe() {
        let check = HealthCheck::for_service(
            &runtime(
                Some(8080),
                HealthCheckConfig {
                    check_type: Some(HealthCheckType::Log),
                    pattern: Some("listening".to_string()),
                    timeout_secs: Some(5),
                    interval_ms: Some(50),
                    ..Default::default()
                },
            ),
            DEFAULT_HEALTH_TIMEOUT,
        );
        assert_eq!(check.probe, Probe::Log("listening".to_string()));
        assert_eq!(check.timeout, Duration::from_secs(5));
        assert_eq!(check.interval, Duration::from_millis(50));

        let check = HealthCheck::for_service(
            &runtime(
                Some(8080),
                HealthCheckConfig {
                    port: Some(9090),
                    path: Some("healthz".to_string()),
                    ..Default::default()
                },
            ),
            DEFAULT_HEALTH_TIMEOUT,
        );
        assert_eq!(
            check.probe,
            Probe::Http {
                port: 9090,
                path: "/healthz".to_string()
            }
        );

        let check = HealthCheck::for_service(
            &runtime(
                Some(8080),
                HealthCheckConfig {
                    check_type: Some(HealthCheckType::Port),
                    ..Default::default()
                },
            ),
            DEFAULT_HEALTH_TIMEOUT,
        );
        assert_eq!(check.probe, Probe::Port(8080));
    }

    /// Serve `status_line` to every request until the task is dropped
    async fn serve_status(status_line: &'static str) -> (u16, tokio::task::JoinHandle<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status_line
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (port, task)
    }

    #[tokio::test]
    async fn test_http_ok() {
        let client = http_client().unwrap();

        let (port, server) = serve_status("200 OK").await;
        assert!(http_ok(&client, port, "/").await);
        server.abort();

        let (port, server) = serve_status("302 Found").await;
        assert!(http_ok(&client, port, "/login").await);
        server.abort();

        let (port, server) = serve_status("503 Service Unavailable").await;
        assert!(!http_ok(&client, port, "/").await);
        server.abort();
    }

    #[tokio::test]
    async fn test_http_check_waits_for_success() {
        let engine = Arc::new(MockEngine::new());
        let controller = ServiceController::new(engine);
        let logs = LogManager::new(
            ".",
            LogConfig {
                file_logging: false,
                ..Default::default()
            },
        );
        let config = ServiceConfig {
            image: Some("nginx".to_string()),
            ..Default::default()
        };
        let rt = ServiceRuntime::from_config("web", &config, Path::new(".")).unwrap();
        let mut process = controller
            .start(&rt, IndexMap::new(), false, &logs)
            .await
            .unwrap();

        let (port, server) = serve_status("500 Internal Server Error").await;
        let check = HealthCheck {
            probe: Probe::Http {
                port,
                path: "/".to_string(),
            },
            timeout: Duration::from_millis(400),
            interval: Duration::from_millis(50),
        };
        let result = check.wait_until_ready(&mut process, &controller, &logs).await;
        assert!(matches!(result, Err(LifecycleError::NotReady { .. })));
        server.abort();

        let (port, server) = serve_status("204 No Content").await;
        let check = HealthCheck {
            probe: Probe::Http {
                port,
                path: "/".to_string(),
            },
            ..check
        };
        check
            .wait_until_ready(&mut process, &controller, &logs)
            .await
            .unwrap();
        assert!(process.ready);
        server.abort();
    }

    #[tokio::test]
    async fn test_port_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_open(port).await);

        drop(listener);
        assert!(!port_open(port).await);
    }

    #[tokio::test]
    async fn test_container_port_probe_times_out() {
        let engine = Arc::new(MockEngine::new());
        let controller = ServiceController::new(engine);
        let logs = LogManager::new(
            ".",
            LogConfig {
                file_logging: false,
                ..Default::default()
            },
        );

        let config = ServiceConfig {
            image: Some("redis".to_string()),
            ..Default::default()
        };
        let rt = ServiceRuntime::from_config("cache", &config, Path::new(".")).unwrap();
        let mut process = controller
            .start(&rt, IndexMap::new(), false, &logs)
            .await
            .unwrap();

        // Nothing listens on a port we just released
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let check = HealthCheck {
            probe: Probe::Port(port),
            timeout: Duration::from_millis(300),
            interval: Duration::from_millis(50),
        };
        let result = check.wait_until_ready(&mut process, &controller, &logs).await;
        assert!(matches!(result, Err(LifecycleError::NotReady { .. })));
        assert!(!process.ready);

        let check = HealthCheck {
            probe: Probe::Process,
            ..check
        };
        check
            .wait_until_ready(&mut process, &controller, &logs)
            .await
            .unwrap();
        assert!(process.ready);
    }
}
