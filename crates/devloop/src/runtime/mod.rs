//! Runtime components: dependency ordering, service lifecycle and
//! orchestration

pub mod container;
pub mod dependency;
pub mod engine;
pub mod health;
pub mod orchestrator;
pub mod process;
pub mod service;

pub use container::*;
pub use dependency::*;
pub use engine::{ContainerConfig, ContainerEngine, ContainerInfo, DockerCli, EngineError, LogStream};
pub use health::*;
pub use orchestrator::*;
pub use process::*;
pub use service::*;
