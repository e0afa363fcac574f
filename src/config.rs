//! Tunables for both binaries. `main` fills these from clap arguments; tests
//! build them directly.

use std::time::Duration;

use crate::error::{ExecutorError, Result};
use crate::proto::ResourceLimits;

pub const DEFAULT_IMAGE: &str = "sandbox-executor:latest";
pub const DEFAULT_SIDECAR_PORT: u16 = 50052;
pub const DEFAULT_WORKING_DIR: &str = "/workspace";

/// Job records are kept this long after teardown for status queries.
pub const JOB_RECORD_TTL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of sandboxes alive at once.
    pub max_concurrent: usize,
    /// Requests allowed to wait for a slot before admission rejects.
    pub queue_depth: usize,
    /// Upper bound on a request's execution, measured from dispatch to the sidecar.
    pub execution_deadline: Duration,
    /// Create + start + connect + first successful ping must finish within this.
    pub provisioning_deadline: Duration,
    /// Wait after `Cancel` before giving up on the sidecar; also the container stop grace.
    pub cancel_grace: Duration,
    /// Upper bound on a whole teardown.
    pub teardown_timeout: Duration,
    pub image: String,
    pub sidecar_port: u16,
    pub network: Option<String>,
    /// Events buffered per job between the sandbox task and the caller.
    pub event_buffer: usize,
    pub job_ttl: Duration,
    pub default_limits: ResourceLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_depth: 16,
            execution_deadline: Duration::from_secs(300),
            provisioning_deadline: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
            teardown_timeout: Duration::from_secs(30),
            image: DEFAULT_IMAGE.to_string(),
            sidecar_port: DEFAULT_SIDECAR_PORT,
            network: None,
            event_buffer: 64,
            job_ttl: Duration::from_secs(JOB_RECORD_TTL_SECS),
            default_limits: default_limits(),
        }
    }
}

fn default_limits() -> ResourceLimits {
    ResourceLimits {
        cpu_cores: 1.0,
        memory_mb: 512,
        timeout_ms: 0,
        cpu_time_secs: 0,
        max_open_files: 256,
        max_output_bytes: 16 * 1024 * 1024,
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(ExecutorError::Config("max_concurrent must be at least 1".into()));
        }
        if self.execution_deadline.is_zero() || self.provisioning_deadline.is_zero() {
            return Err(ExecutorError::Config("deadlines must be non-zero".into()));
        }
        if self.event_buffer == 0 {
            return Err(ExecutorError::Config("event_buffer must be at least 1".into()));
        }
        Ok(())
    }

    /// Request limits with zero fields filled from the configured defaults.
    pub fn effective_limits(&self, requested: Option<&ResourceLimits>) -> ResourceLimits {
        let d = &self.default_limits;
        let Some(r) = requested else {
            return *d;
        };
        ResourceLimits {
            cpu_cores: if r.cpu_cores > 0.0 { r.cpu_cores } else { d.cpu_cores },
            memory_mb: pick(r.memory_mb, d.memory_mb),
            timeout_ms: pick(r.timeout_ms, d.timeout_ms),
            cpu_time_secs: pick(r.cpu_time_secs, d.cpu_time_secs),
            max_open_files: pick(r.max_open_files, d.max_open_files),
            max_output_bytes: pick(r.max_output_bytes, d.max_output_bytes),
        }
    }

    /// The request's own timeout, capped by the server-wide deadline.
    pub fn deadline_for(&self, limits: &ResourceLimits) -> Duration {
        if limits.timeout_ms == 0 {
            return self.execution_deadline;
        }
        Duration::from_millis(limits.timeout_ms).min(self.execution_deadline)
    }
}

fn pick(requested: u64, default: u64) -> u64 {
    if requested > 0 {
        requested
    } else {
        default
    }
}

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub port: u16,
    /// SIGTERM → SIGKILL escalation delay for a cancelled subprocess.
    pub kill_grace: Duration,
    pub default_working_dir: String,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SIDECAR_PORT,
            kill_grace: Duration::from_secs(3),
            default_working_dir: DEFAULT_WORKING_DIR.to_string(),
        }
    }
}
