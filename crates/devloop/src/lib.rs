//! devloop
//!
//! Runs a project's services on the local machine.
//!
//! # Overview
//!
//! - Services and the resources they use are declared in a YAML manifest
//! - Services start level by level in dependency order; a level must be
//!   ready before the next one starts
//! - Services run as native processes or, when they declare an `image`, as
//!   containers
//! - Output is collected into bounded per-service log buffers that can be
//!   queried, tailed live and mirrored to `.azure/logs/<service>.log`.
//!   Known noise is filtered out first.
//! - Every ready service is advertised to its dependents through
//!   `SERVICE_URL_<NAME>`, `SERVICE_PORT_<NAME>` and `SERVICE_HOST_<NAME>`
//!
//! # Example Manifest
//!
//! ```yaml
//! name: shop
//! services:
//!   web:
//!     command: npm
//!     args: [run, dev]
//!     port: 3000
//!     uses: [api]
//!   api:
//!     image: ghcr.io/acme/api:latest
//!     port: 8080
//!     uses: [db]
//!     env:
//!       DATABASE_URL: postgres://localhost/${DB_NAME}
//!     healthcheck:
//!       type: http
//!       path: /healthz
//! resources:
//!   db:
//!     type: postgres
//! logs:
//!   filters:
//!     exclude: ["^GET /healthz"]
//! ```

pub mod cli;
pub mod config;
pub mod logs;
pub mod runtime;

pub use cli::RunArgs;
pub use config::{EnvironmentError, EnvironmentResolver, Manifest, ManifestError};
pub use logs::{
    LogBuffer, LogConfig, LogEntry, LogError, LogFilter, LogLevel, LogManager, Subscription,
};
pub use runtime::{
    ContainerEngine, DependencyError, DependencyGraph, DockerCli, EngineError, LaunchPlan,
    LifecycleError, Orchestrator, OrchestratorConfig, OrchestratorError, ServiceController,
    ServiceProcess, ServiceRuntime,
};
