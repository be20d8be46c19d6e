//! Backend process supervisor for the VisionForge desktop shell.
//!
//! Launches the local image-processing backend (bundled executable or Python
//! interpreter against the backend source tree), persists its output, recovers
//! from early failures with a one-shot dependency install and relaunch, polls
//! the health endpoint before the shell treats the backend as usable, and
//! tears the process down across platforms, including the Windows fallback
//! paths where lifecycle signals are unreliable.

pub mod config;
pub mod errors;
pub mod installer;
pub mod launch_plan;
pub mod log_sink;
pub mod platform;
pub mod process;
pub mod readiness;
pub mod runtime_paths;
pub mod runtime_resolver;
pub mod shell_log;
pub mod supervisor;
pub mod watchdog;

pub use errors::SupervisorError;
pub use launch_plan::{LaunchMode, LaunchPlan};
pub use platform::{default_platform, PlatformAdapter};
pub use readiness::HealthStatus;
pub use supervisor::{StartupOutcome, Supervisor, SupervisorOptions, SupervisorState};
pub use watchdog::WatchdogHandle;
