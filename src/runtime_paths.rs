use std::{
    env,
    path::{Path, PathBuf},
};

/// Per-installation application data directory. `VISIONFORGE_HOME` wins, then
/// `~/.visionforge`, then a temp-dir fallback so logging never has nowhere to
/// go.
pub fn app_data_dir() -> PathBuf {
    if let Ok(custom) = env::var("VISIONFORGE_HOME") {
        let candidate = PathBuf::from(custom.trim());
        if !candidate.as_os_str().is_empty() {
            return candidate;
        }
    }
    if let Some(home) = home::home_dir() {
        return home.join(".visionforge");
    }
    env::temp_dir().join("visionforge")
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Locates the backend source tree for interpreter-mode launches.
pub fn detect_backend_source_root() -> Option<PathBuf> {
    let explicit = env::var("VISIONFORGE_BACKEND_DIR")
        .ok()
        .map(|value| PathBuf::from(value.trim()));
    detect_backend_source_root_with(workspace_root_dir(), explicit)
}

pub fn workspace_root_dir() -> PathBuf {
    let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    candidate
        .canonicalize()
        .unwrap_or_else(|_| candidate.to_path_buf())
}

fn detect_backend_source_root_with(
    workspace_root: PathBuf,
    explicit_backend_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(candidate) = explicit_backend_dir {
        if is_backend_source_dir(&candidate) {
            return Some(candidate.canonicalize().unwrap_or(candidate));
        }
    }

    let candidates = [
        workspace_root.join("backend"),
        workspace_root.join("..").join("backend"),
    ];
    for candidate in candidates {
        if is_backend_source_dir(&candidate) {
            return Some(candidate.canonicalize().unwrap_or(candidate));
        }
    }
    None
}

fn is_backend_source_dir(candidate: &Path) -> bool {
    candidate.join("main.py").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;

    #[test]
    fn is_backend_source_dir_requires_entry_script() {
        let dir = tempfile::tempdir().expect("create temp dir");
        assert!(!is_backend_source_dir(dir.path()));

        File::create(dir.path().join("main.py"))
            .and_then(|mut file| file.write_all(b"app = None"))
            .expect("create main.py");
        assert!(is_backend_source_dir(dir.path()));
    }

    #[test]
    fn detect_backend_source_root_with_prefers_explicit_dir() {
        let workspace = tempfile::tempdir().expect("create workspace dir");
        let explicit = tempfile::tempdir().expect("create explicit dir");
        File::create(explicit.path().join("main.py"))
            .and_then(|mut file| file.write_all(b"app = None"))
            .expect("create explicit main.py");

        let detected = detect_backend_source_root_with(
            workspace.path().to_path_buf(),
            Some(explicit.path().to_path_buf()),
        )
        .expect("explicit backend dir should be detected");
        assert_eq!(
            detected,
            explicit
                .path()
                .canonicalize()
                .expect("canonicalize explicit dir")
        );
    }

    #[test]
    fn detect_backend_source_root_with_falls_back_to_workspace_backend_dir() {
        let workspace = tempfile::tempdir().expect("create workspace dir");
        let backend = workspace.path().join("backend");
        fs::create_dir_all(&backend).expect("create backend dir");
        File::create(backend.join("main.py"))
            .and_then(|mut file| file.write_all(b"app = None"))
            .expect("create main.py");

        let detected = detect_backend_source_root_with(workspace.path().to_path_buf(), None)
            .expect("workspace backend dir should be detected");
        assert_eq!(
            detected,
            backend.canonicalize().expect("canonicalize backend dir")
        );
    }
}
