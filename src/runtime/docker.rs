//! Docker-backed runtime using bollard. Each sandbox is one container whose
//! entrypoint runs `executor sidecar`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{ContainerHandle, ContainerRuntime, ContainerSpec, Result};
use crate::error::RuntimeError;

const LABEL_PREFIX: &str = "sandbox-executor";

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Check the engine answers before the server starts taking requests.
    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await.map_err(map_err)?;
        Ok(())
    }

    /// Pull `image` from its registry, draining the progress stream.
    async fn pull(&self, image: &str) -> Result<()> {
        info!(%image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.client.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update = update.map_err(map_err)?;
            if let Some(error) = update.error {
                return Err(RuntimeError::Failed(format!("pull {}: {}", image, error)));
            }
            if let Some(status) = update.status {
                debug!(%image, %status, "pull progress");
            }
        }
        Ok(())
    }
}

fn sidecar_port_key(port: u16) -> String {
    format!("{}/tcp", port)
}

/// Convert a sandbox spec to the bollard create config.
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut labels = spec.labels.clone();
    labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
    labels.insert(format!("{}.sandbox", LABEL_PREFIX), spec.name.clone());

    let port_key = sidecar_port_key(spec.sidecar_port);
    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key.clone(), HashMap::new());

    // With a shared network the server dials the container IP; otherwise the
    // sidecar port is published on an ephemeral loopback port.
    let port_bindings = match spec.network {
        Some(_) => None,
        None => Some(HashMap::from([(
            port_key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(String::new()),
            }]),
        )])),
    };

    let limits = &spec.limits;
    let host_config = HostConfig {
        memory: (limits.memory_mb > 0).then(|| memory_bytes(limits.memory_mb)),
        nano_cpus: (limits.cpu_cores > 0.0).then(|| (limits.cpu_cores * 1e9) as i64),
        pids_limit: Some(512),
        network_mode: spec.network.clone(),
        port_bindings,
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(vec![
            "executor".to_string(),
            "sidecar".to_string(),
            "--port".to_string(),
            spec.sidecar_port.to_string(),
        ]),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn memory_bytes(memory_mb: u64) -> i64 {
    i64::try_from(memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
}

fn map_err(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Failed(format!("{}: {}", status_code, message)),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        info!(name = %spec.name, image = %spec.image, "Creating container");
        let options = || CreateContainerOptions {
            name: format!("{}-{}", LABEL_PREFIX, spec.name),
            platform: None,
        };
        let created = match self
            .client
            .create_container(Some(options()), container_config(spec))
            .await
        {
            // Image missing locally: pull once and retry.
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                self.pull(&spec.image).await?;
                self.client
                    .create_container(Some(options()), container_config(spec))
                    .await
                    .map_err(map_err)?
            }
            other => other.map_err(map_err)?,
        };
        for warning in &created.warnings {
            debug!(container_id = %created.id, %warning, "docker create warning");
        }
        Ok(ContainerHandle::new(created.id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        info!(container_id = %handle.id(), "Starting container");
        self.client
            .start_container(handle.id(), None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    async fn endpoint(&self, handle: &ContainerHandle) -> Result<String> {
        let inspect = self
            .client
            .inspect_container(handle.id(), None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        let settings = inspect
            .network_settings
            .ok_or_else(|| RuntimeError::Failed("container has no network settings".into()))?;
        let exposed = inspect
            .config
            .and_then(|c| c.exposed_ports)
            .and_then(|ports| ports.into_keys().next())
            .ok_or_else(|| RuntimeError::Failed("container exposes no sidecar port".into()))?;

        // Published on loopback?
        if let Some(host_port) = settings
            .ports
            .as_ref()
            .and_then(|ports| ports.get(&exposed))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|binding| binding.host_port.clone())
            .filter(|port| !port.is_empty())
        {
            return Ok(format!("http://127.0.0.1:{}", host_port));
        }

        // Otherwise dial the container on its network.
        let port = exposed.split('/').next().unwrap_or_default();
        let ip = settings
            .networks
            .as_ref()
            .and_then(|networks| {
                networks
                    .values()
                    .filter_map(|n| n.ip_address.clone())
                    .find(|ip| !ip.is_empty())
            })
            .ok_or_else(|| RuntimeError::Failed("container has no reachable address".into()))?;
        Ok(format!("http://{}:{}", ip, port))
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        info!(container_id = %handle.id(), grace_secs = grace.as_secs(), "Stopping container");
        let options = StopContainerOptions {
            t: grace.as_secs().max(1) as i64,
        };
        match self.client.stop_container(handle.id(), Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        info!(container_id = %handle.id(), "Removing container");
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(handle.id(), Some(options))
            .await
            .map_err(map_err)
    }

    async fn oom_killed(&self, handle: &ContainerHandle) -> Result<bool> {
        let inspect = self
            .client
            .inspect_container(handle.id(), None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        Ok(inspect
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ResourceLimits;

    fn spec(network: Option<&str>) -> ContainerSpec {
        ContainerSpec {
            name: "abc".into(),
            image: "sandbox-executor:latest".into(),
            limits: ResourceLimits {
                cpu_cores: 0.5,
                memory_mb: 256,
                ..Default::default()
            },
            network: network.map(String::from),
            sidecar_port: 50052,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn config_carries_limits_and_labels() {
        let config = container_config(&spec(None));
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        let labels = config.labels.unwrap();
        assert_eq!(labels.get("sandbox-executor.sandbox").map(String::as_str), Some("abc"));
        let bindings = host.port_bindings.unwrap();
        assert!(bindings.contains_key("50052/tcp"));
        assert_eq!(
            config.cmd.unwrap(),
            vec!["executor", "sidecar", "--port", "50052"]
        );
    }

    #[test]
    fn oversized_memory_limit_saturates() {
        let mut huge = spec(None);
        huge.limits.memory_mb = u64::MAX / 1024;
        let host = container_config(&huge).host_config.unwrap();
        assert_eq!(host.memory, Some(i64::MAX));
        assert_eq!(memory_bytes(1), 1024 * 1024);
    }

    #[test]
    fn shared_network_skips_port_publishing() {
        let config = container_config(&spec(Some("sandboxes")));
        let host = config.host_config.unwrap();
        assert!(host.port_bindings.is_none());
        assert_eq!(host.network_mode.as_deref(), Some("sandboxes"));
    }

    #[test]
    fn not_found_is_distinguished() {
        let err = map_err(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        });
        assert!(err.is_not_found());
    }
}
