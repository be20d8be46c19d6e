use std::{process::Stdio, time::Duration};

use tokio::{process::Command, time::timeout};

use crate::errors::SupervisorError;

/// Probes candidate runtime commands in order with a cheap, bounded version
/// query and returns the first one that exits successfully. Interpreter-mode
/// startup cannot proceed without one, so exhausting the list is an error
/// rather than a silent fallback.
pub async fn resolve_runtime<F>(
    candidates: &[String],
    probe_timeout: Duration,
    log: F,
) -> Result<String, SupervisorError>
where
    F: Fn(&str) + Copy,
{
    for candidate in candidates {
        if probe_runtime(candidate, probe_timeout, log).await {
            log(&format!("resolved backend runtime: {candidate}"));
            return Ok(candidate.clone());
        }
    }

    Err(SupervisorError::EnvironmentResolution {
        tried: candidates.to_vec(),
    })
}

async fn probe_runtime<F>(candidate: &str, probe_timeout: Duration, log: F) -> bool
where
    F: Fn(&str),
{
    let mut command = Command::new(candidate);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(crate::platform::WINDOWS_CREATE_NO_WINDOW);
    }

    let child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            log(&format!("runtime candidate {candidate} not spawnable: {error}"));
            return false;
        }
    };

    match timeout(probe_timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => true,
        Ok(Ok(output)) => {
            log(&format!(
                "runtime candidate {candidate} version probe exited {:?}",
                output.status.code()
            ));
            false
        }
        Ok(Err(error)) => {
            log(&format!(
                "runtime candidate {candidate} version probe failed: {error}"
            ));
            false
        }
        Err(_) => {
            log(&format!(
                "runtime candidate {candidate} version probe timed out after {}ms",
                probe_timeout.as_millis()
            ));
            false
        }
    }
}
