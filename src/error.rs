//! Error taxonomy for the orchestrator, the container runtime and the sidecar.
//!
//! Only validation and capacity problems are returned to callers as errors.
//! Everything that happens after admission is reported as a `Terminal` event.

use tonic::Status;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("capacity exceeded: {running} sandboxes running, {queued} queued")]
    CapacityExceeded { running: usize, queued: usize },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

impl From<ExecutorError> for Status {
    fn from(err: ExecutorError) -> Self {
        match &err {
            ExecutorError::InvalidRequest(_) => Status::invalid_argument(err.to_string()),
            ExecutorError::CapacityExceeded { .. } => Status::resource_exhausted(err.to_string()),
            ExecutorError::JobNotFound(_) => Status::not_found(err.to_string()),
            ExecutorError::Config(_) | ExecutorError::Internal(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}

/// Failures reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container operation failed: {0}")]
    Failed(String),
}

impl RuntimeError {
    /// The container is already gone; teardown treats this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Protocol-level rejections raised by the sidecar before anything is spawned.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("missing command")]
    MissingCommand,

    #[error("invalid workspace file path: {0}")]
    InvalidPath(String),

    #[error("execute already called on this sidecar")]
    AlreadyExecuted,
}

impl From<SidecarError> for Status {
    fn from(err: SidecarError) -> Self {
        match err {
            SidecarError::AlreadyExecuted => Status::failed_precondition(err.to_string()),
            SidecarError::MissingCommand | SidecarError::InvalidPath(_) => {
                Status::invalid_argument(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn capacity_maps_to_resource_exhausted() {
        let status: Status = ExecutorError::CapacityExceeded {
            running: 2,
            queued: 4,
        }
        .into();
        assert_eq!(status.code(), Code::ResourceExhausted);
        assert!(status.message().contains("2 sandboxes running"));
    }

    #[test]
    fn second_execute_is_failed_precondition() {
        let status: Status = SidecarError::AlreadyExecuted.into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        let status: Status = SidecarError::MissingCommand.into();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
