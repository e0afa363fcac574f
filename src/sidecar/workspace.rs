//! Request validation and working-directory preparation inside the sandbox.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::error::SidecarError;
use crate::proto::{ExecutionRequest, WorkspaceFile};

/// Reject requests that must never reach the spawner.
pub fn validate_request(req: &ExecutionRequest) -> Result<(), SidecarError> {
    if req.command.trim().is_empty() {
        return Err(SidecarError::MissingCommand);
    }
    for file in &req.files {
        relative_path(&file.path)?;
    }
    Ok(())
}

/// A workspace path must be relative and stay below the working directory.
fn relative_path(path: &str) -> Result<PathBuf, SidecarError> {
    let candidate = Path::new(path);
    if path.is_empty() || candidate.is_absolute() {
        return Err(SidecarError::InvalidPath(path.to_string()));
    }
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(SidecarError::InvalidPath(path.to_string())),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(SidecarError::InvalidPath(path.to_string()));
    }
    Ok(clean)
}

/// Create `working_dir` and write the request's files into it.
pub async fn prepare(working_dir: &Path, files: &[WorkspaceFile]) -> Result<(), String> {
    tokio::fs::create_dir_all(working_dir)
        .await
        .map_err(|e| format!("mkdir {}: {}", working_dir.display(), e))?;

    for file in files {
        let relative = relative_path(&file.path).map_err(|e| e.to_string())?;
        let full_path = working_dir.join(relative);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("mkdir parent: {}", e))?;
        }
        tokio::fs::write(&full_path, &file.content)
            .await
            .map_err(|e| format!("write {}: {}", file.path, e))?;

        let mode = if file.executable { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(&full_path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| format!("chmod {}: {}", file.path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, paths: &[&str]) -> ExecutionRequest {
        ExecutionRequest {
            command: command.to_string(),
            files: paths
                .iter()
                .map(|p| WorkspaceFile {
                    path: p.to_string(),
                    content: b"x".to_vec(),
                    executable: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn blank_command_is_rejected() {
        assert!(matches!(
            validate_request(&request("  ", &[])),
            Err(SidecarError::MissingCommand)
        ));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        for bad in ["/etc/passwd", "../up", "a/../../b", "", "."] {
            assert!(
                validate_request(&request("true", &[bad])).is_err(),
                "{bad} should be rejected"
            );
        }
        assert!(validate_request(&request("true", &["src/main.py", "./run.sh"])).is_ok());
    }

    #[tokio::test]
    async fn writes_files_with_modes() {
        let dir = std::env::temp_dir().join(format!("workspace-test-{}", uuid::Uuid::new_v4()));
        let files = vec![
            WorkspaceFile {
                path: "bin/run.sh".into(),
                content: b"#!/bin/sh\necho ok\n".to_vec(),
                executable: true,
            },
            WorkspaceFile {
                path: "data.txt".into(),
                content: b"hello".to_vec(),
                executable: false,
            },
        ];
        prepare(&dir, &files).await.unwrap();

        let script = std::fs::metadata(dir.join("bin/run.sh")).unwrap();
        assert_eq!(script.permissions().mode() & 0o777, 0o755);
        assert_eq!(std::fs::read(dir.join("data.txt")).unwrap(), b"hello");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
