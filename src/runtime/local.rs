//! In-process runtime: every "container" is a sidecar gRPC server on an
//! ephemeral loopback port inside this process, with its own scratch
//! directory. Used by `--runtime local` and by the tests, which is why it
//! keeps call statistics and supports fault injection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ContainerHandle, ContainerRuntime, ContainerSpec, Result};
use crate::config::SidecarConfig;
use crate::error::RuntimeError;
use crate::sidecar;

/// Counters observed by tests.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub created: usize,
    pub started: usize,
    pub removed: usize,
    /// Created and not yet removed.
    pub live: usize,
    /// Highest `live` ever observed.
    pub peak_live: usize,
    pub stop_calls: HashMap<String, usize>,
    pub remove_calls: HashMap<String, usize>,
}

struct LocalContainer {
    scratch_dir: PathBuf,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
    endpoint: Option<String>,
    oom_killed: bool,
}

#[derive(Default)]
struct LocalState {
    next_id: u64,
    containers: HashMap<String, LocalContainer>,
    stats: RuntimeStats,
}

#[derive(Default)]
struct Faults {
    create_delay: Mutex<Option<Duration>>,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    unresponsive: AtomicBool,
    fail_remove: AtomicBool,
}

pub struct LocalRuntime {
    sidecar: SidecarConfig,
    scratch_root: PathBuf,
    state: Mutex<LocalState>,
    faults: Faults,
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new(SidecarConfig::default())
    }
}

impl LocalRuntime {
    pub fn new(sidecar: SidecarConfig) -> Self {
        Self {
            sidecar,
            scratch_root: std::env::temp_dir().join("sandbox-executor"),
            state: Mutex::new(LocalState::default()),
            faults: Faults::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> RuntimeStats {
        self.lock().stats.clone()
    }

    /// Ids of containers created and not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Every `create` takes this long before the container exists.
    pub fn create_delay(&self, delay: Option<Duration>) {
        *self
            .faults
            .create_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    pub fn fail_create(&self, on: bool) {
        self.faults.fail_create.store(on, Ordering::SeqCst);
    }

    pub fn fail_start(&self, on: bool) {
        self.faults.fail_start.store(on, Ordering::SeqCst);
    }

    /// Started containers never answer on their endpoint.
    pub fn unresponsive(&self, on: bool) {
        self.faults.unresponsive.store(on, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, on: bool) {
        self.faults.fail_remove.store(on, Ordering::SeqCst);
    }

    /// Kill a container's sidecar abruptly: its process dies and any open
    /// `Execute` stream ends without a terminal event.
    pub fn crash(&self, container_id: &str) -> bool {
        match self.lock().containers.get(container_id) {
            Some(container) => {
                container.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    /// Like [`crash`](Self::crash), and the runtime afterwards reports the
    /// container as OOM-killed.
    pub fn oom_kill(&self, container_id: &str) -> bool {
        match self.lock().containers.get_mut(container_id) {
            Some(container) => {
                container.oom_killed = true;
                container.shutdown.cancel();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let delay = *self
            .faults
            .create_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed(format!("image {} not available", spec.image)));
        }
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("local-{}-{}", state.next_id, spec.name);
        let scratch_dir = self.scratch_root.join(&id);
        state.containers.insert(
            id.clone(),
            LocalContainer {
                scratch_dir,
                shutdown: CancellationToken::new(),
                server: None,
                endpoint: None,
                oom_killed: false,
            },
        );
        state.stats.created += 1;
        state.stats.live = state.containers.len();
        state.stats.peak_live = state.stats.peak_live.max(state.stats.live);
        info!(container_id = %id, "Created local container");
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        if self.faults.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed("container exited during start".into()));
        }
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("bind: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::Unavailable(format!("local_addr: {}", e)))?;
        let endpoint = format!("http://{}", addr);

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(handle.id())
            .ok_or_else(|| RuntimeError::NotFound(handle.id().to_string()))?;

        if self.faults.unresponsive.load(Ordering::SeqCst) {
            // Nothing will ever listen here.
            drop(listener);
        } else {
            let config = SidecarConfig {
                default_working_dir: container.scratch_dir.to_string_lossy().into_owned(),
                ..self.sidecar.clone()
            };
            let shutdown = container.shutdown.clone();
            let container_id = handle.id().to_string();
            container.server = Some(tokio::spawn(async move {
                if let Err(e) = sidecar::serve(listener, config, shutdown).await {
                    warn!(%container_id, error = %e, "local sidecar exited with error");
                }
            }));
        }
        container.endpoint = Some(endpoint);
        state.stats.started += 1;
        Ok(())
    }

    async fn endpoint(&self, handle: &ContainerHandle) -> Result<String> {
        self.lock()
            .containers
            .get(handle.id())
            .and_then(|c| c.endpoint.clone())
            .ok_or_else(|| RuntimeError::NotFound(handle.id().to_string()))
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        let server = {
            let mut state = self.lock();
            *state
                .stats
                .stop_calls
                .entry(handle.id().to_string())
                .or_default() += 1;
            let container = state
                .containers
                .get_mut(handle.id())
                .ok_or_else(|| RuntimeError::NotFound(handle.id().to_string()))?;
            container.shutdown.cancel();
            container.server.take()
        };
        if let Some(mut server) = server {
            if tokio::time::timeout(grace, &mut server).await.is_err() {
                warn!(container_id = %handle.id(), "local sidecar did not stop in time, aborting");
                server.abort();
            }
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let removed = {
            let mut state = self.lock();
            *state
                .stats
                .remove_calls
                .entry(handle.id().to_string())
                .or_default() += 1;
            if self.faults.fail_remove.load(Ordering::SeqCst) {
                return Err(RuntimeError::Unavailable("runtime unreachable".into()));
            }
            let removed = state
                .containers
                .remove(handle.id())
                .ok_or_else(|| RuntimeError::NotFound(handle.id().to_string()))?;
            state.stats.removed += 1;
            state.stats.live = state.containers.len();
            removed
        };
        removed.shutdown.cancel();
        if let Some(server) = removed.server {
            server.abort();
        }
        let _ = tokio::fs::remove_dir_all(&removed.scratch_dir).await;
        info!(container_id = %handle.id(), "Removed local container");
        Ok(())
    }

    async fn oom_killed(&self, handle: &ContainerHandle) -> Result<bool> {
        self.lock()
            .containers
            .get(handle.id())
            .map(|c| c.oom_killed)
            .ok_or_else(|| RuntimeError::NotFound(handle.id().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::sidecar_client::SidecarClient;
    use crate::proto::{PingRequest, ResourceLimits};

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            image: "local".into(),
            limits: ResourceLimits::default(),
            network: None,
            sidecar_port: 0,
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn started_container_answers_ping() {
        let runtime = LocalRuntime::default();
        let handle = runtime.create(&spec("a")).await.unwrap();
        runtime.start(&handle).await.unwrap();
        let endpoint = runtime.endpoint(&handle).await.unwrap();

        let mut client = SidecarClient::connect(endpoint).await.unwrap();
        let pong = client.ping(PingRequest {}).await.unwrap().into_inner();
        assert!(!pong.busy);

        runtime.stop(&handle, Duration::from_secs(1)).await.unwrap();
        runtime.remove(&handle).await.unwrap();
        let stats = runtime.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.removed, 1);
    }

    #[tokio::test]
    async fn remove_twice_reports_not_found() {
        let runtime = LocalRuntime::default();
        let handle = runtime.create(&spec("b")).await.unwrap();
        runtime.remove(&handle).await.unwrap();
        let err = runtime.remove(&handle).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(runtime.stats().remove_calls.get(handle.id()), Some(&2));
    }

    #[tokio::test]
    async fn oom_kill_is_reported_until_removal() {
        let runtime = LocalRuntime::default();
        let handle = runtime.create(&spec("m")).await.unwrap();
        assert!(!runtime.oom_killed(&handle).await.unwrap());
        assert!(runtime.oom_kill(handle.id()));
        assert!(runtime.oom_killed(&handle).await.unwrap());
        runtime.remove(&handle).await.unwrap();
        assert!(runtime.oom_killed(&handle).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn peak_tracks_simultaneous_containers() {
        let runtime = LocalRuntime::default();
        let a = runtime.create(&spec("a")).await.unwrap();
        let b = runtime.create(&spec("b")).await.unwrap();
        runtime.remove(&a).await.unwrap();
        let _c = runtime.create(&spec("c")).await.unwrap();
        runtime.remove(&b).await.unwrap();
        let stats = runtime.stats();
        assert_eq!(stats.peak_live, 2);
        assert_eq!(stats.live, 1);
    }
}
