use std::{io, path::PathBuf};

use thiserror::Error;

/// Failure taxonomy for the supervisor. None of these abort the shell: the
/// window opens regardless and the caller decides what to surface.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No candidate runtime answered its version probe. Fatal to
    /// interpreter-mode startup; the shell runs degraded.
    #[error("no usable backend runtime found, tried: {}", tried.join(", "))]
    EnvironmentResolution { tried: Vec<String> },

    /// The spawn call itself failed, e.g. the executable is missing. Distinct
    /// from a process that started and then crashed.
    #[error("failed to spawn backend process `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The backend exited inside the grace window. The first occurrence
    /// triggers the install-and-retry path; the second is terminal.
    #[error("backend exited ({status}) within the {grace_ms}ms grace window")]
    EarlyExit { status: String, grace_ms: u64 },

    /// The dependency install step failed. Logged and ignored: the relaunch
    /// is attempted anyway since a partial install may still be usable.
    #[error("backend dependency install failed: {reason}")]
    DependencyInstall { reason: String },

    /// The health endpoint never answered 2xx within the bound. The shell
    /// shows a warning naming the backend log file and keeps running.
    #[error(
        "backend did not become ready within {timeout_ms}ms, see log at {}",
        log_path.display()
    )]
    ReadinessTimeout { timeout_ms: u64, log_path: PathBuf },

    /// A `VISIONFORGE_BACKEND_CMD` override that cannot be used as a command
    /// line.
    #[error("invalid {env_name} override: {reason}")]
    InvalidOverride {
        env_name: &'static str,
        reason: String,
    },
}
