//! Container runtime capability consumed by the lifecycle manager.
//!
//! The manager never talks to a container engine directly; everything goes
//! through [`ContainerRuntime`], so the core can run against Docker or against
//! the in-process [`LocalRuntime`].

mod docker;
mod local;

pub use docker::DockerRuntime;
pub use local::{LocalRuntime, RuntimeStats};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::proto::ResourceLimits;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Sandbox id; used for the container name and labels.
    pub name: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub network: Option<String>,
    /// Port the sidecar listens on inside the container.
    pub sidecar_port: u16,
    pub labels: HashMap<String, String>,
}

/// Opaque reference to a created container. Owned by exactly one lifecycle
/// manager; not `Clone` so ownership cannot be shared by accident.
#[derive(Debug, PartialEq, Eq)]
pub struct ContainerHandle {
    id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable name for logs (e.g. "docker").
    fn name(&self) -> &str;

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// URI of the sidecar's gRPC endpoint, valid once the container is started.
    async fn endpoint(&self, handle: &ContainerHandle) -> Result<String>;

    /// Stop the container, waiting up to `grace` before killing it.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// Whether the kernel OOM killer ended a process in the container.
    async fn oom_killed(&self, handle: &ContainerHandle) -> Result<bool>;
}
