use std::{
    env,
    ffi::OsString,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use crate::runtime_paths;

pub const SHELL_LOG_FILE: &str = "shell.log";
pub const SHELL_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const LOG_BACKUP_COUNT: usize = 5;

static SHELL_LOG_WRITE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellLogCategory {
    Startup,
    Runtime,
    Retry,
    Shutdown,
}

impl ShellLogCategory {
    fn as_label(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Runtime => "runtime",
            Self::Retry => "retry",
            Self::Shutdown => "shutdown",
        }
    }
}

pub fn append_startup_log(message: &str) {
    append_shell_log(ShellLogCategory::Startup, message);
}

pub fn append_runtime_log(message: &str) {
    append_shell_log(ShellLogCategory::Runtime, message);
}

pub fn append_retry_log(message: &str) {
    append_shell_log(ShellLogCategory::Retry, message);
}

pub fn append_shutdown_log(message: &str) {
    append_shell_log(ShellLogCategory::Shutdown, message);
}

pub fn append_shell_log(category: ShellLogCategory, message: &str) {
    let path = resolve_shell_log_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _guard = match SHELL_LOG_WRITE_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    rotate_log_if_needed(&path, SHELL_LOG_MAX_BYTES, LOG_BACKUP_COUNT, "shell");
    let timestamp = chrono::Local::now()
        .format("%Y-%m-%d %H:%M:%S%.3f %z")
        .to_string();
    let line = format!("[{}] [{}] {}\n", timestamp, category.as_label(), message);
    let _ = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
}

pub fn resolve_shell_log_path() -> PathBuf {
    if let Ok(custom) = env::var("VISIONFORGE_SHELL_LOG_PATH") {
        let candidate = PathBuf::from(custom.trim());
        if !candidate.as_os_str().is_empty() {
            return candidate;
        }
    }
    runtime_paths::logs_dir(&runtime_paths::app_data_dir()).join(SHELL_LOG_FILE)
}

pub fn rotate_log_if_needed(path: &Path, max_bytes: u64, backup_count: usize, log_scope: &str) {
    if max_bytes == 0 || backup_count == 0 {
        return;
    }

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::NotFound {
                eprintln!(
                    "[log rotation:{log_scope}] failed to read metadata for {}: {}",
                    path.display(),
                    error
                );
            }
            return;
        }
    };
    if metadata.len() < max_bytes {
        return;
    }

    let oldest = rotated_log_path(path, backup_count);
    if let Err(error) = fs::remove_file(&oldest) {
        if error.kind() != std::io::ErrorKind::NotFound {
            eprintln!(
                "[log rotation:{log_scope}] failed to remove oldest backup {}: {}",
                oldest.display(),
                error
            );
        }
    }

    for index in (1..backup_count).rev() {
        let source = rotated_log_path(path, index);
        if !source.exists() {
            continue;
        }
        let target = rotated_log_path(path, index + 1);
        if let Err(error) = fs::rename(&source, &target) {
            eprintln!(
                "[log rotation:{log_scope}] failed to rename {} to {}: {}",
                source.display(),
                target.display(),
                error
            );
        }
    }

    let rotated = rotated_log_path(path, 1);
    if let Err(error) = fs::rename(path, &rotated) {
        eprintln!(
            "[log rotation:{log_scope}] failed to rotate {} to {}: {}",
            path.display(),
            rotated.display(),
            error
        );
    }
}

fn rotated_log_path(path: &Path, index: usize) -> PathBuf {
    let mut value = OsString::from(path.as_os_str());
    value.push(format!(".{index}"));
    PathBuf::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_log_if_needed_keeps_small_files_in_place() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("shell.log");
        fs::write(&path, b"short").expect("write log");

        rotate_log_if_needed(&path, 1024, 3, "test");
        assert!(path.exists());
        assert!(!rotated_log_path(&path, 1).exists());
    }

    #[test]
    fn rotate_log_if_needed_shifts_backups_in_order() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("shell.log");

        fs::write(&path, b"first generation").expect("write log");
        rotate_log_if_needed(&path, 1, 3, "test");
        fs::write(&path, b"second generation").expect("write log");
        rotate_log_if_needed(&path, 1, 3, "test");

        assert!(!path.exists());
        assert_eq!(
            fs::read(rotated_log_path(&path, 1)).expect("read .1"),
            b"second generation"
        );
        assert_eq!(
            fs::read(rotated_log_path(&path, 2)).expect("read .2"),
            b"first generation"
        );
    }

    #[test]
    fn rotate_log_if_needed_is_disabled_by_zero_limits() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("shell.log");
        fs::write(&path, b"payload").expect("write log");

        rotate_log_if_needed(&path, 0, 3, "test");
        rotate_log_if_needed(&path, 1, 0, "test");
        assert!(path.exists());
        assert!(!rotated_log_path(&path, 1).exists());
    }
}
