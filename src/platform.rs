use std::{
    io,
    process::{Command, ExitStatus, Stdio},
    sync::Arc,
};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use crate::shell_log::append_shutdown_log;

#[cfg(target_os = "windows")]
pub const WINDOWS_CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(target_os = "windows")]
pub const WINDOWS_CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Platform-specific command ordering and termination surface, selected once
/// at startup and injected everywhere that launches or kills the backend.
pub trait PlatformAdapter: Send + Sync {
    /// Candidate runtime commands, most preferred first.
    fn candidate_runtimes(&self) -> Vec<String>;

    /// Cooperative stop request for the tracked pid and its tree.
    fn terminate_gracefully(&self, pid: u32);

    /// Unconditional kill for the tracked pid and its process group/tree.
    fn terminate_forcefully(&self, pid: u32);

    /// Last-resort kill addressed to the executable image name, for the
    /// platform where signal delivery to interpreted children is unreliable.
    /// Elsewhere this is a no-op.
    fn kill_by_image_name(&self, image_name: &str);

    /// Whether `kill_by_image_name` is part of the escalation sequence.
    fn uses_image_name_fallback(&self) -> bool {
        false
    }
}

pub fn default_platform() -> Arc<dyn PlatformAdapter> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(WindowsPlatform)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Arc::new(UnixPlatform)
    }
}

/// Runs a short-lived helper command (`kill`, `taskkill`) with null stdio and
/// logs non-success outcomes. Termination is best-effort by design, so the
/// status is returned but callers usually ignore it.
fn run_kill_command<F>(
    label: &str,
    program: &str,
    args: &[&str],
    log: F,
) -> io::Result<ExitStatus>
where
    F: Fn(&str) + Copy,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .stdin(Stdio::null());
    #[cfg(target_os = "windows")]
    {
        // Avoid flashing transient console windows when invoking taskkill.
        command.creation_flags(WINDOWS_CREATE_NO_WINDOW);
    }
    let status = command.status();

    match &status {
        Ok(exit_status) if exit_status.success() => {}
        Ok(exit_status) => log(&format!("{label} returned non-zero: status={exit_status:?}")),
        Err(error) => log(&format!("{label} failed to start: error={error}")),
    }

    status
}

pub struct UnixPlatform;

impl PlatformAdapter for UnixPlatform {
    fn candidate_runtimes(&self) -> Vec<String> {
        vec!["python3".to_string(), "python".to_string()]
    }

    fn terminate_gracefully(&self, pid: u32) {
        let pid_arg = pid.to_string();
        let _ = run_kill_command(
            "kill -TERM",
            "kill",
            &["-TERM", &pid_arg],
            append_shutdown_log,
        );
    }

    fn terminate_forcefully(&self, pid: u32) {
        let pid_arg = pid.to_string();
        let _ = run_kill_command(
            "kill -KILL",
            "kill",
            &["-KILL", &pid_arg],
            append_shutdown_log,
        );
        // The child may have spawned workers of its own; address the whole
        // process group as well.
        let group_arg = format!("-{pid}");
        let _ = run_kill_command(
            "kill -KILL group",
            "kill",
            &["-KILL", "--", &group_arg],
            append_shutdown_log,
        );
    }

    fn kill_by_image_name(&self, _image_name: &str) {
        // Signals are honored reliably here; the image-name fallback is a
        // Windows-only escalation step.
    }
}

pub struct WindowsPlatform;

impl PlatformAdapter for WindowsPlatform {
    fn candidate_runtimes(&self) -> Vec<String> {
        // The launcher shim resolves the registered interpreter and is present
        // even when python.exe is not on PATH.
        vec!["py".to_string(), "python".to_string()]
    }

    fn terminate_gracefully(&self, pid: u32) {
        let pid_arg = pid.to_string();
        let _ = run_kill_command(
            "taskkill graceful stop",
            "taskkill",
            &["/pid", &pid_arg, "/t"],
            append_shutdown_log,
        );
    }

    fn terminate_forcefully(&self, pid: u32) {
        let pid_arg = pid.to_string();
        let _ = run_kill_command(
            "taskkill force stop",
            "taskkill",
            &["/pid", &pid_arg, "/t", "/f"],
            append_shutdown_log,
        );
    }

    fn kill_by_image_name(&self, image_name: &str) {
        let _ = run_kill_command(
            "taskkill by image",
            "taskkill",
            &["/im", image_name, "/t", "/f"],
            append_shutdown_log,
        );
    }

    fn uses_image_name_fallback(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn candidate_ordering_prefers_launcher_on_windows_and_python3_elsewhere() {
        assert_eq!(WindowsPlatform.candidate_runtimes(), vec!["py", "python"]);
        assert_eq!(UnixPlatform.candidate_runtimes(), vec!["python3", "python"]);
    }

    #[test]
    fn image_name_fallback_is_windows_only() {
        assert!(WindowsPlatform.uses_image_name_fallback());
        assert!(!UnixPlatform.uses_image_name_fallback());
    }

    #[cfg(unix)]
    #[test]
    fn run_kill_command_logs_non_zero_status() {
        let logs = Mutex::new(Vec::new());
        let status = run_kill_command("false helper", "false", &[], |message| {
            logs.lock().expect("lock logs").push(message.to_string())
        })
        .expect("false should spawn");

        assert!(!status.success());
        let snapshot = logs.lock().expect("lock logs");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].contains("returned non-zero"));
    }

    #[test]
    fn run_kill_command_logs_spawn_failure() {
        let logs = Mutex::new(Vec::new());
        let status = run_kill_command(
            "missing helper",
            "definitely-not-a-real-kill-helper",
            &[],
            |message| logs.lock().expect("lock logs").push(message.to_string()),
        );

        assert!(status.is_err());
        let snapshot = logs.lock().expect("lock logs");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].contains("failed to start"));
    }
}
