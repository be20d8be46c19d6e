use std::{
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use tokio::{
    io::AsyncReadExt,
    process::Command,
    sync::{mpsc, watch},
    time::timeout,
};

use crate::{
    errors::SupervisorError,
    launch_plan::{LaunchMode, LaunchPlan},
};

const OUTPUT_READ_BUFFER: usize = 8 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One raw read from the child's stdout or stderr. The per-stream order is
/// preserved; interleaving between the two streams is not.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

/// Handle to a spawned backend. Exposes the finite output stream (ends at
/// process exit) and a single exit result observable from any number of
/// waiters. At most one of these is live at a time; the supervisor owns that
/// invariant.
#[derive(Debug)]
pub struct BackendProcess {
    pid: u32,
    mode: LaunchMode,
    started_at: Instant,
    output: Option<mpsc::Receiver<OutputChunk>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl BackendProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The output stream can be consumed by exactly one reader.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputChunk>> {
        self.output.take()
    }

    /// Non-blocking liveness probe.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Cloneable view of the single exit result, usable after the handle
    /// itself has been handed elsewhere.
    pub fn exit_watcher(&self) -> ExitWatcher {
        ExitWatcher {
            exit_rx: self.exit_rx.clone(),
        }
    }

    /// Resolves once the process has exited. Returns `None` when no exit was
    /// ever observed because the underlying wait on the child failed.
    pub async fn wait_exit(&self) -> Option<ExitStatus> {
        self.exit_watcher().wait().await
    }

    /// Bounded exit wait used by the grace window and shutdown escalation.
    pub async fn wait_exit_within(&self, limit: Duration) -> Option<ExitStatus> {
        self.exit_watcher().wait_within(limit).await
    }
}

#[derive(Clone)]
pub struct ExitWatcher {
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl ExitWatcher {
    pub fn status(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }

    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut exit_rx = self.exit_rx.clone();
        loop {
            if let Some(status) = *exit_rx.borrow() {
                return Some(status);
            }
            if exit_rx.changed().await.is_err() {
                return *exit_rx.borrow();
            }
        }
    }

    pub async fn wait_within(&self, limit: Duration) -> Option<ExitStatus> {
        match timeout(limit, self.wait()).await {
            Ok(status) => status,
            Err(_) => None,
        }
    }
}

pub fn format_exit_status(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => match status.code() {
            Some(code) => format!("exit code {code}"),
            None => format!("{status}"),
        },
        None => "unknown exit status".to_string(),
    }
}

/// Spawns the backend with the plan's exact argument vector (never through a
/// shell), the parent environment plus the plan's embedded-run overrides, and
/// piped output wired into the chunk channel. Returns immediately; readiness
/// is the caller's concern.
pub fn spawn_backend(plan: &LaunchPlan) -> Result<BackendProcess, SupervisorError> {
    if !plan.cwd.exists() {
        std::fs::create_dir_all(&plan.cwd).map_err(|error| SupervisorError::Launch {
            command: plan.debug_command().join(" "),
            source: error,
        })?;
    }

    let mut command = Command::new(&plan.cmd);
    command
        .args(&plan.args)
        .current_dir(&plan.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (name, value) in &plan.env_overrides {
        command.env(name, value);
    }
    #[cfg(unix)]
    {
        // Lead a fresh process group so the force-kill escalation can
        // address the whole tree (uvicorn workers included) through the
        // group id.
        command.process_group(0);
    }
    #[cfg(target_os = "windows")]
    {
        // Keep the supervised backend fully backgrounded and give it its own
        // process group so tree-kill escalation has something to address.
        command.creation_flags(
            crate::platform::WINDOWS_CREATE_NO_WINDOW
                | crate::platform::WINDOWS_CREATE_NEW_PROCESS_GROUP,
        );
    }

    let mut child = command.spawn().map_err(|error| SupervisorError::Launch {
        command: plan.debug_command().join(" "),
        source: error,
    })?;
    let pid = child.id().unwrap_or(0);

    let (chunk_tx, chunk_rx) = mpsc::channel::<OutputChunk>(OUTPUT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        spawn_output_pump(stdout, OutputStream::Stdout, chunk_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_output_pump(stderr, OutputStream::Stderr, chunk_tx);
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                let _ = exit_tx.send(Some(status));
                // Keep the sender alive so late waiters still observe the
                // status.
                exit_tx.closed().await;
            }
            // Dropping the sender closes the channel; waiters then observe
            // `None` instead of an exit status.
            Err(_) => {}
        }
    });

    Ok(BackendProcess {
        pid,
        mode: plan.mode,
        started_at: Instant::now(),
        output: Some(chunk_rx),
        exit_rx,
    })
}

fn spawn_output_pump<R>(mut reader: R, stream: OutputStream, sender: mpsc::Sender<OutputChunk>)
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0u8; OUTPUT_READ_BUFFER];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let chunk = OutputChunk {
                        stream,
                        bytes: buffer[..read].to_vec(),
                    };
                    if sender.send(chunk).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell_plan(script: &str) -> LaunchPlan {
        LaunchPlan {
            mode: LaunchMode::Interpreter,
            cmd: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env_overrides: vec![("VF_TEST_MARKER".to_string(), "1".to_string())],
        }
    }

    async fn collect_output(process: &mut BackendProcess) -> Vec<OutputChunk> {
        let mut receiver = process.take_output().expect("output not yet taken");
        let mut chunks = Vec::new();
        while let Some(chunk) = receiver.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_backend_streams_both_pipes_and_reports_exit() {
        let mut process =
            spawn_backend(&shell_plan("echo out-line; echo err-line 1>&2; exit 0"))
                .expect("spawn shell");
        assert!(process.pid() > 0);

        let chunks = collect_output(&mut process).await;
        let stdout_bytes: Vec<u8> = chunks
            .iter()
            .filter(|chunk| chunk.stream == OutputStream::Stdout)
            .flat_map(|chunk| chunk.bytes.clone())
            .collect();
        let stderr_bytes: Vec<u8> = chunks
            .iter()
            .filter(|chunk| chunk.stream == OutputStream::Stderr)
            .flat_map(|chunk| chunk.bytes.clone())
            .collect();
        assert_eq!(String::from_utf8_lossy(&stdout_bytes), "out-line\n");
        assert_eq!(String::from_utf8_lossy(&stderr_bytes), "err-line\n");

        let status = process
            .wait_exit_within(Duration::from_secs(5))
            .await
            .expect("exit observed");
        assert!(status.success());
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_backend_passes_env_overrides_to_the_child() {
        let mut process = spawn_backend(&shell_plan("printf '%s' \"$VF_TEST_MARKER\""))
            .expect("spawn shell");
        let chunks = collect_output(&mut process).await;
        let stdout_bytes: Vec<u8> = chunks
            .iter()
            .filter(|chunk| chunk.stream == OutputStream::Stdout)
            .flat_map(|chunk| chunk.bytes.clone())
            .collect();
        assert_eq!(String::from_utf8_lossy(&stdout_bytes), "1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_backend_reports_nonzero_exit_codes() {
        let process = spawn_backend(&shell_plan("exit 7")).expect("spawn shell");
        let status = process
            .wait_exit_within(Duration::from_secs(5))
            .await
            .expect("exit observed");
        assert_eq!(status.code(), Some(7));
        assert_eq!(format_exit_status(Some(status)), "exit code 7");
    }

    #[tokio::test]
    async fn spawn_backend_surfaces_missing_executable_as_launch_error() {
        let plan = LaunchPlan {
            mode: LaunchMode::Bundled,
            cmd: "definitely-not-a-real-backend-binary".to_string(),
            args: Vec::new(),
            cwd: PathBuf::from(std::env::temp_dir()),
            env_overrides: Vec::new(),
        };
        let error = spawn_backend(&plan).expect_err("spawn must fail");
        match error {
            SupervisorError::Launch { command, .. } => {
                assert!(command.contains("definitely-not-a-real-backend-binary"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_backend_child_leads_its_own_process_group() {
        let process = spawn_backend(&shell_plan("sleep 5")).expect("spawn shell");
        let group_arg = format!("-{}", process.pid());

        // A kill addressed to the group id only succeeds if the child
        // actually leads a group of its own.
        let status = std::process::Command::new("kill")
            .args(["-KILL", "--", &group_arg])
            .status()
            .expect("run kill");
        assert!(status.success());

        let status = process
            .wait_exit_within(Duration::from_secs(5))
            .await
            .expect("exit observed");
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_stream_can_only_be_taken_once() {
        let mut process = spawn_backend(&shell_plan("true")).expect("spawn shell");
        assert!(process.take_output().is_some());
        assert!(process.take_output().is_none());
        process.wait_exit_within(Duration::from_secs(5)).await;
    }
}
