use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    config::{BACKEND_CMD_ENV, BACKEND_CWD_ENV},
    errors::SupervisorError,
    runtime_paths,
};

pub const BUNDLED_ARTIFACT_NAME: &str = if cfg!(target_os = "windows") {
    "visionforge-backend.exe"
} else {
    "visionforge-backend"
};
pub const RUNTIME_MANIFEST_NAME: &str = "runtime-manifest.json";

/// Marker telling the backend it runs embedded, so it can adjust logging.
pub const SUPERVISED_ENV: &str = "VISIONFORGE_SUPERVISED";
/// Disables the backend's own file-watching auto-restart; the shell owns
/// restart policy.
pub const RELOAD_ENV: &str = "RELOAD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Self-contained pre-built backend executable.
    Bundled,
    /// General-purpose runtime invoked against the backend entry module.
    Interpreter,
}

/// Immutable description of one launch attempt. The argument vector is passed
/// to the process verbatim, never through a shell.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub mode: LaunchMode,
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env_overrides: Vec<(String, String)>,
}

impl LaunchPlan {
    /// Executable image name used for the last-resort kill-by-name fallback.
    pub fn image_name(&self) -> String {
        Path::new(&self.cmd)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.cmd.clone())
    }

    pub fn debug_command(&self) -> Vec<String> {
        let mut parts = vec![self.cmd.clone()];
        parts.extend(self.args.clone());
        parts
    }
}

/// Optional manifest shipped next to the bundled artifact, naming the
/// executable and health path when they differ from the defaults.
#[derive(Debug, Default, Deserialize)]
pub struct RuntimeManifest {
    pub executable: Option<String>,
    pub health_path: Option<String>,
}

fn embedded_env_overrides() -> Vec<(String, String)> {
    vec![
        (SUPERVISED_ENV.to_string(), "1".to_string()),
        (RELOAD_ENV.to_string(), "false".to_string()),
    ]
}

fn interpreter_env_overrides() -> Vec<(String, String)> {
    let mut overrides = embedded_env_overrides();
    overrides.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
    overrides.push((
        "PYTHONUTF8".to_string(),
        env::var("PYTHONUTF8").unwrap_or_else(|_| "1".to_string()),
    ));
    overrides.push((
        "PYTHONIOENCODING".to_string(),
        env::var("PYTHONIOENCODING").unwrap_or_else(|_| "utf-8".to_string()),
    ));
    overrides
}

/// `VISIONFORGE_BACKEND_CMD` override, split shell-style but executed without
/// a shell.
pub fn resolve_custom_launch(raw_cmd: &str) -> Result<LaunchPlan, SupervisorError> {
    let mut pieces = shlex::split(raw_cmd).ok_or_else(|| SupervisorError::InvalidOverride {
        env_name: BACKEND_CMD_ENV,
        reason: format!("cannot split '{raw_cmd}'"),
    })?;
    if pieces.is_empty() {
        return Err(SupervisorError::InvalidOverride {
            env_name: BACKEND_CMD_ENV,
            reason: "override is empty".to_string(),
        });
    }

    let cmd = pieces.remove(0);
    let cwd = env::var(BACKEND_CWD_ENV)
        .map(PathBuf::from)
        .ok()
        .or_else(runtime_paths::detect_backend_source_root)
        .unwrap_or_else(runtime_paths::workspace_root_dir);

    Ok(LaunchPlan {
        mode: LaunchMode::Interpreter,
        cmd,
        args: pieces,
        cwd,
        env_overrides: interpreter_env_overrides(),
    })
}

/// Bundled mode wins when the packaged artifact exists and the shell runs
/// packaged. Absence is not an error, it simply falls through to interpreter
/// mode; a broken manifest is logged and ignored the same way.
pub fn resolve_bundled_launch<F>(resources_dir: &Path, packaged: bool, log: F) -> Option<LaunchPlan>
where
    F: Fn(&str) + Copy,
{
    if !packaged {
        return None;
    }
    let backend_dir = resources_dir.join("backend");
    let manifest = read_runtime_manifest(&backend_dir, log);
    let artifact_name = manifest
        .executable
        .as_deref()
        .unwrap_or(BUNDLED_ARTIFACT_NAME);
    let artifact = backend_dir.join(artifact_name);
    if !artifact.is_file() {
        return None;
    }

    Some(LaunchPlan {
        mode: LaunchMode::Bundled,
        cmd: artifact.to_string_lossy().to_string(),
        args: Vec::new(),
        cwd: backend_dir,
        env_overrides: embedded_env_overrides(),
    })
}

/// Interpreter mode: the resolved runtime runs uvicorn against the backend
/// entry module.
pub fn resolve_interpreter_launch(runtime_cmd: &str, backend_dir: &Path) -> LaunchPlan {
    LaunchPlan {
        mode: LaunchMode::Interpreter,
        cmd: runtime_cmd.to_string(),
        args: vec![
            "-m".to_string(),
            "uvicorn".to_string(),
            "main:app".to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            "8000".to_string(),
        ],
        cwd: backend_dir.to_path_buf(),
        env_overrides: interpreter_env_overrides(),
    }
}

fn read_runtime_manifest<F>(backend_dir: &Path, log: F) -> RuntimeManifest
where
    F: Fn(&str),
{
    let manifest_path = backend_dir.join(RUNTIME_MANIFEST_NAME);
    if !manifest_path.is_file() {
        return RuntimeManifest::default();
    }
    let manifest_text = match fs::read_to_string(&manifest_path) {
        Ok(text) => text,
        Err(error) => {
            log(&format!(
                "failed to read runtime manifest {}: {}",
                manifest_path.display(),
                error
            ));
            return RuntimeManifest::default();
        }
    };
    match serde_json::from_str(&manifest_text) {
        Ok(manifest) => manifest,
        Err(error) => {
            log(&format!(
                "failed to parse runtime manifest {}: {}",
                manifest_path.display(),
                error
            ));
            RuntimeManifest::default()
        }
    }
}
