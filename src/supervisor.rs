use std::{
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use tokio::sync::Mutex;

use crate::{
    config::{self, ReadinessConfig},
    errors::SupervisorError,
    installer, launch_plan,
    launch_plan::{LaunchMode, LaunchPlan},
    log_sink::LogSession,
    platform::PlatformAdapter,
    process::{self, BackendProcess, OutputStream},
    readiness::{self, HealthStatus},
    runtime_paths, runtime_resolver,
    shell_log::{append_retry_log, append_runtime_log, append_shutdown_log, append_startup_log},
};

/// Single source of truth for what the shell may assume about the backend.
/// Transitions move forward only, except for the one permitted
/// install-and-retry loop (`Installing` back to `Launching`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Resolving,
    Launching,
    Installing,
    Running,
    Ready,
    Degraded,
    Stopping,
    ForceStopping,
    Stopped,
}

impl SupervisorState {
    fn as_label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Launching => "launching",
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::ForceStopping => "force-stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Everything one supervisor instance needs, resolved once at shell startup.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Production packaging flag; bundled mode is only considered when set.
    pub packaged: bool,
    pub resources_dir: PathBuf,
    pub backend_dir: PathBuf,
    pub backend_url: String,
    pub data_dir: PathBuf,
    pub backend_cmd_override: Option<String>,
    pub auto_start: bool,
    pub grace_window: Duration,
    pub shutdown_grace: Duration,
    pub readiness: ReadinessConfig,
}

impl SupervisorOptions {
    pub fn from_env<F>(log: F) -> Self
    where
        F: Fn(&str) + Copy,
    {
        let packaged = std::env::var("VISIONFORGE_PACKAGED")
            .map(|value| value.trim() == "1")
            .unwrap_or(false);
        let resources_dir = std::env::var("VISIONFORGE_RESOURCES_DIR")
            .map(|value| PathBuf::from(value.trim()))
            .unwrap_or_else(|_| runtime_paths::workspace_root_dir().join("resources"));
        let backend_dir = runtime_paths::detect_backend_source_root()
            .unwrap_or_else(|| runtime_paths::workspace_root_dir().join("backend"));
        let backend_url = std::env::var("VISIONFORGE_BACKEND_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| config::DEFAULT_BACKEND_URL.to_string());
        let backend_cmd_override = std::env::var(config::BACKEND_CMD_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Self {
            packaged,
            resources_dir,
            backend_dir,
            backend_url,
            data_dir: runtime_paths::app_data_dir(),
            backend_cmd_override,
            auto_start: config::auto_start_enabled(),
            grace_window: Duration::from_millis(config::DEFAULT_GRACE_WINDOW_MS),
            shutdown_grace: Duration::from_millis(config::DEFAULT_SHUTDOWN_GRACE_MS),
            readiness: config::resolve_readiness_config(|message| log(&message)),
        }
    }
}

/// What `start` produced. The shell always opens its window; this only
/// decides whether a degraded-mode warning is shown and what it names.
#[derive(Debug)]
pub struct StartupOutcome {
    /// Launch attempts actually made (0 when adopted or degraded before
    /// spawn, 2 after the single install-and-retry cycle).
    pub attempts: u32,
    pub health: HealthStatus,
    /// Backend log file of the last attempt, named by degraded-mode dialogs.
    pub log_path: Option<PathBuf>,
    /// Present when the backend is unusable or unconfirmed; never fatal to
    /// the shell.
    pub degraded: Option<SupervisorError>,
    /// True when an already-running backend was adopted instead of spawned.
    pub adopted: bool,
}

impl StartupOutcome {
    pub fn is_ready(&self) -> bool {
        self.health.ready
    }

    fn not_ready(attempts: u32, degraded: Option<SupervisorError>) -> Self {
        Self {
            attempts,
            health: HealthStatus {
                ready: false,
                elapsed: Duration::ZERO,
            },
            log_path: None,
            degraded,
            adopted: false,
        }
    }
}

#[derive(Default)]
struct ActiveBackend {
    process: Option<BackendProcess>,
    session_path: Option<PathBuf>,
    session: Option<LogSession>,
    image_name: Option<String>,
}

/// Owns the backend lifecycle. Exactly one live process at a time; shutdown
/// is idempotent and safe under overlapping exit hooks.
pub struct Supervisor {
    options: SupervisorOptions,
    platform: Arc<dyn PlatformAdapter>,
    client: reqwest::Client,
    state: StdMutex<SupervisorState>,
    starting: AtomicBool,
    active: Mutex<ActiveBackend>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions, platform: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            options,
            platform,
            client: reqwest::Client::new(),
            state: StdMutex::new(SupervisorState::Idle),
            starting: AtomicBool::new(false),
            active: Mutex::new(ActiveBackend::default()),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Image name of the active backend, for the watchdog's kill fallback.
    pub async fn backend_image_name(&self) -> Option<String> {
        self.active.lock().await.image_name.clone()
    }

    pub fn state(&self) -> SupervisorState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: SupervisorState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != next {
            append_runtime_log(&format!(
                "supervisor state: {} -> {}",
                guard.as_label(),
                next.as_label()
            ));
            *guard = next;
        }
    }

    /// Brings the backend up: picks a launch strategy, resolves a runtime if
    /// needed, spawns, recovers from one early failure with a dependency
    /// install and a single relaunch, then waits for readiness. Never errors;
    /// every failure degrades into the returned outcome.
    pub async fn start(&self) -> StartupOutcome {
        let Some(_start_guard) = AtomicFlagGuard::try_set(&self.starting) else {
            append_startup_log("backend start already in progress, ignoring duplicate call");
            return StartupOutcome::not_ready(0, None);
        };

        self.set_state(SupervisorState::Resolving);

        if readiness::ping_backend(&self.options.backend_url, self.options.readiness.probe_timeout)
            .await
        {
            append_startup_log("backend already reachable, adopting it instead of spawning");
            let health = readiness::wait_until_ready(
                &self.client,
                &self.options.backend_url,
                &self.options.readiness,
                append_startup_log,
            )
            .await;
            self.set_state(if health.ready {
                SupervisorState::Ready
            } else {
                SupervisorState::Degraded
            });
            return StartupOutcome {
                attempts: 0,
                health,
                log_path: None,
                degraded: None,
                adopted: true,
            };
        }

        if !self.options.auto_start {
            append_startup_log(&format!(
                "backend auto-start disabled ({}=0)",
                config::BACKEND_AUTO_START_ENV
            ));
            self.set_state(SupervisorState::Degraded);
            return StartupOutcome::not_ready(0, None);
        }

        let plan = match self.resolve_launch_plan().await {
            Ok(plan) => plan,
            Err(error) => {
                append_startup_log(&format!("backend launch plan unavailable: {error}"));
                self.set_state(SupervisorState::Degraded);
                return StartupOutcome::not_ready(0, Some(error));
            }
        };
        append_startup_log(&format!(
            "backend launch plan: mode={:?}, cmd={:?}, cwd={}",
            plan.mode,
            plan.debug_command(),
            plan.cwd.display()
        ));

        let mut attempts: u32 = 0;
        self.set_state(SupervisorState::Launching);
        if let Err(error) = self.launch_attempt(&plan).await {
            self.set_state(SupervisorState::Degraded);
            return StartupOutcome::not_ready(attempts, Some(error));
        }
        attempts += 1;

        // Early-failure recovery applies to interpreter mode only: an exit
        // inside the grace window usually means missing Python dependencies.
        if plan.mode == LaunchMode::Interpreter {
            if let Some(status) = self.wait_grace_window().await {
                append_retry_log(&format!(
                    "backend exited early ({}), running dependency install before the single retry",
                    process::format_exit_status(Some(status))
                ));
                self.clear_active_backend().await;
                self.set_state(SupervisorState::Installing);
                if let Err(error) =
                    installer::install_dependencies(&plan.cmd, &plan.cwd, append_retry_log).await
                {
                    // Best effort: a partial install may still be usable.
                    append_retry_log(&format!("{error}, retrying launch anyway"));
                }

                self.set_state(SupervisorState::Launching);
                if let Err(error) = self.launch_attempt(&plan).await {
                    self.set_state(SupervisorState::Degraded);
                    return StartupOutcome::not_ready(attempts, Some(error));
                }
                attempts += 1;

                if let Some(status) = self.wait_grace_window().await {
                    let error = SupervisorError::EarlyExit {
                        status: process::format_exit_status(Some(status)),
                        grace_ms: self.options.grace_window.as_millis() as u64,
                    };
                    append_retry_log(&format!("backend failed again after retry: {error}"));
                    let log_path = self.clear_active_backend().await;
                    self.set_state(SupervisorState::Degraded);
                    return StartupOutcome {
                        attempts,
                        health: HealthStatus {
                            ready: false,
                            elapsed: Duration::ZERO,
                        },
                        log_path,
                        degraded: Some(error),
                        adopted: false,
                    };
                }
            }
        }

        self.set_state(SupervisorState::Running);
        let health = readiness::wait_until_ready(
            &self.client,
            &self.options.backend_url,
            &self.options.readiness,
            append_startup_log,
        )
        .await;

        let log_path = self.active.lock().await.session_path.clone();
        if health.ready {
            self.set_state(SupervisorState::Ready);
            StartupOutcome {
                attempts,
                health,
                log_path,
                degraded: None,
                adopted: false,
            }
        } else {
            self.set_state(SupervisorState::Degraded);
            let degraded = Some(SupervisorError::ReadinessTimeout {
                timeout_ms: self.options.readiness.timeout.as_millis() as u64,
                log_path: log_path.clone().unwrap_or_default(),
            });
            StartupOutcome {
                attempts,
                health,
                log_path,
                degraded,
                adopted: false,
            }
        }
    }

    async fn resolve_launch_plan(&self) -> Result<LaunchPlan, SupervisorError> {
        if let Some(raw_cmd) = &self.options.backend_cmd_override {
            return launch_plan::resolve_custom_launch(raw_cmd);
        }

        if let Some(plan) = launch_plan::resolve_bundled_launch(
            &self.options.resources_dir,
            self.options.packaged,
            append_startup_log,
        ) {
            return Ok(plan);
        }

        let runtime_cmd = runtime_resolver::resolve_runtime(
            &self.platform.candidate_runtimes(),
            Duration::from_millis(config::RUNTIME_PROBE_TIMEOUT_MS),
            append_startup_log,
        )
        .await?;
        Ok(launch_plan::resolve_interpreter_launch(
            &runtime_cmd,
            &self.options.backend_dir,
        ))
    }

    /// Spawns one attempt with a fresh log session and wires the output
    /// stream into it. The previous attempt's session is fully drained before
    /// this is called, so sessions never interleave.
    async fn launch_attempt(&self, plan: &LaunchPlan) -> Result<(), SupervisorError> {
        let mut active = self.active.lock().await;
        if let Some(existing) = &active.process {
            if !existing.has_exited() {
                append_startup_log("backend child already exists, skip re-spawn");
                return Ok(());
            }
        }

        let logs_dir = runtime_paths::logs_dir(&self.options.data_dir);
        let session = LogSession::create(&logs_dir)
            .await
            .map_err(|error| SupervisorError::Launch {
                command: plan.debug_command().join(" "),
                source: error,
            })?;

        let mut process = process::spawn_backend(plan)?;
        append_startup_log(&format!(
            "spawned backend: pid={}, log={}",
            process.pid(),
            session.path().display()
        ));

        if let Some(output) = process.take_output() {
            spawn_output_forwarder(output, session.sender());
        }

        active.session_path = Some(session.path().to_path_buf());
        active.session = Some(session);
        active.image_name = Some(plan.image_name());
        active.process = Some(process);
        Ok(())
    }

    /// Returns the exit status if the process died inside the grace window,
    /// `None` if the window elapsed first. Once the window has elapsed the
    /// process is presumed started and later exits are not recovered.
    async fn wait_grace_window(&self) -> Option<std::process::ExitStatus> {
        let process_wait = {
            let active = self.active.lock().await;
            let process = active.process.as_ref()?;
            if let Some(status) = process.exit_status() {
                return Some(status);
            }
            process.exit_watcher()
        };
        process_wait.wait_within(self.options.grace_window).await
    }

    /// Drops the active process handle and closes its log session, draining
    /// buffered output first. Returns the session's file path.
    async fn clear_active_backend(&self) -> Option<PathBuf> {
        let mut active = self.active.lock().await;
        active.process = None;
        active.image_name = None;
        if let Some(session) = active.session.take() {
            session.close().await;
        }
        active.session_path.clone()
    }

    /// Brings any active process to a terminated state. Safe to call from
    /// multiple overlapping exit hooks: callers serialize on the internal
    /// lock and every call after the first is a no-op beyond harmless
    /// redundant kill requests.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        let Some(process) = active.process.take() else {
            append_shutdown_log("shutdown requested with no active backend, nothing to do");
            self.set_state(SupervisorState::Stopped);
            return;
        };
        let image_name = active.image_name.take();

        self.set_state(SupervisorState::Stopping);
        let mut machine = ShutdownMachine::new();
        let actions = PlatformShutdownActions {
            platform: self.platform.as_ref(),
            pid: process.pid(),
            image_name: image_name.as_deref(),
        };
        let watcher = process.exit_watcher();
        run_shutdown_steps(
            &mut machine,
            self.options.shutdown_grace,
            |limit| {
                let watcher = watcher.clone();
                async move { watcher.wait_within(limit).await.is_some() }
            },
            &actions,
            |phase| self.set_state(phase.as_supervisor_state()),
        )
        .await;

        if let Some(session) = active.session.take() {
            session.close().await;
        }
        self.set_state(SupervisorState::Stopped);
        append_shutdown_log("backend shutdown sequence finished");
    }
}

fn spawn_output_forwarder(
    mut output: tokio::sync::mpsc::Receiver<process::OutputChunk>,
    sink: tokio::sync::mpsc::Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            // Mirror into the shell log as well as the per-session file.
            let text = String::from_utf8_lossy(&chunk.bytes);
            let label = match chunk.stream {
                OutputStream::Stdout => "backend stdout",
                OutputStream::Stderr => "backend stderr",
            };
            for line in text.lines().filter(|line| !line.trim().is_empty()) {
                append_runtime_log(&format!("{label}: {line}"));
            }
            if sink.send(chunk.bytes).await.is_err() {
                break;
            }
        }
    });
}

/// Two-step escalation driven by a single scheduled liveness check:
/// `Stopping` waits out the grace period, `ForceStopping` issues the
/// unconditional kill (plus the image-name fallback where signals are
/// unreliable), and `Stopped` is terminal either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Stopping,
    ForceStopping,
    Stopped,
}

impl ShutdownPhase {
    fn as_supervisor_state(self) -> SupervisorState {
        match self {
            Self::Stopping => SupervisorState::Stopping,
            Self::ForceStopping => SupervisorState::ForceStopping,
            Self::Stopped => SupervisorState::Stopped,
        }
    }
}

pub struct ShutdownMachine {
    phase: ShutdownPhase,
}

impl ShutdownMachine {
    pub fn new() -> Self {
        Self {
            phase: ShutdownPhase::Stopping,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    fn escalate(&mut self) {
        if self.phase == ShutdownPhase::Stopping {
            self.phase = ShutdownPhase::ForceStopping;
        }
    }

    fn finish(&mut self) {
        self.phase = ShutdownPhase::Stopped;
    }
}

impl Default for ShutdownMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Termination surface the shutdown sequence drives. Production forwards to
/// the platform adapter; tests inject recorders.
pub trait ShutdownActions {
    fn terminate_gracefully(&self);
    fn terminate_forcefully(&self);
    fn kill_by_image_name(&self);
    fn image_fallback_enabled(&self) -> bool;
}

struct PlatformShutdownActions<'a> {
    platform: &'a dyn PlatformAdapter,
    pid: u32,
    image_name: Option<&'a str>,
}

impl ShutdownActions for PlatformShutdownActions<'_> {
    fn terminate_gracefully(&self) {
        append_shutdown_log(&format!("graceful stop requested for pid {}", self.pid));
        self.platform.terminate_gracefully(self.pid);
    }

    fn terminate_forcefully(&self) {
        append_shutdown_log(&format!("force kill issued for pid {} and its tree", self.pid));
        self.platform.terminate_forcefully(self.pid);
    }

    fn kill_by_image_name(&self) {
        if let Some(image_name) = self.image_name {
            append_shutdown_log(&format!("image-name kill fallback issued for {image_name}"));
            self.platform.kill_by_image_name(image_name);
        }
    }

    fn image_fallback_enabled(&self) -> bool {
        self.platform.uses_image_name_fallback() && self.image_name.is_some()
    }
}

const FORCE_STOP_FOLLOWUP_WAIT: Duration = Duration::from_millis(500);

/// Kill requests are fire-and-forget with best-effort confirmation: the
/// machine reaches `Stopped` whether or not the process is confirmed dead.
pub async fn run_shutdown_steps<W, Fut, S>(
    machine: &mut ShutdownMachine,
    grace: Duration,
    wait_exit: W,
    actions: &dyn ShutdownActions,
    mut on_phase: S,
) where
    W: Fn(Duration) -> Fut,
    Fut: Future<Output = bool>,
    S: FnMut(ShutdownPhase),
{
    on_phase(machine.phase());
    actions.terminate_gracefully();
    if wait_exit(grace).await {
        machine.finish();
        on_phase(machine.phase());
        return;
    }

    machine.escalate();
    on_phase(machine.phase());
    actions.terminate_forcefully();
    if actions.image_fallback_enabled() {
        actions.kill_by_image_name();
    }
    wait_exit(FORCE_STOP_FOLLOWUP_WAIT).await;

    machine.finish();
    on_phase(machine.phase());
}

/// RAII guard around a busy flag; clears it on drop.
struct AtomicFlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> AtomicFlagGuard<'a> {
    fn try_set(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self { flag })
    }
}

impl Drop for AtomicFlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
