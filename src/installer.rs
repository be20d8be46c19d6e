use std::{path::Path, process::Stdio};

use tokio::process::Command;

use crate::errors::SupervisorError;

pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// One-shot dependency install, run when the backend dies inside the grace
/// window. Awaited by the retry flow; failure is reported but never blocks
/// the relaunch, since a partial install can still leave a usable
/// environment.
pub async fn install_dependencies<F>(
    runtime_cmd: &str,
    backend_dir: &Path,
    log: F,
) -> Result<(), SupervisorError>
where
    F: Fn(&str) + Copy,
{
    log(&format!(
        "installing backend dependencies with {runtime_cmd} in {}",
        backend_dir.display()
    ));

    let mut command = Command::new(runtime_cmd);
    command
        .args(["-m", "pip", "install", "-r", REQUIREMENTS_FILE])
        .current_dir(backend_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(crate::platform::WINDOWS_CREATE_NO_WINDOW);
    }

    let status = command
        .status()
        .await
        .map_err(|error| SupervisorError::DependencyInstall {
            reason: format!("pip invocation via {runtime_cmd} failed to start: {error}"),
        })?;

    if status.success() {
        log("backend dependency install finished");
        Ok(())
    } else {
        Err(SupervisorError::DependencyInstall {
            reason: format!("pip exited with {status}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn install_dependencies_succeeds_when_installer_exits_zero() {
        let dir = tempfile::tempdir().expect("create temp dir");
        // `true` swallows the pip argument vector and exits 0.
        install_dependencies("true", dir.path(), |_| {})
            .await
            .expect("zero exit is success");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_dependencies_reports_non_zero_exit() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let error = install_dependencies("false", dir.path(), |_| {})
            .await
            .expect_err("non-zero exit is a failure");
        assert!(matches!(error, SupervisorError::DependencyInstall { .. }));
    }

    #[tokio::test]
    async fn install_dependencies_reports_unspawnable_runtime() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let error = install_dependencies("definitely-missing-runtime-pip", dir.path(), |_| {})
            .await
            .expect_err("missing runtime cannot install");
        match error {
            SupervisorError::DependencyInstall { reason } => {
                assert!(reason.contains("failed to start"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
