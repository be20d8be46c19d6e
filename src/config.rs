use std::{env, time::Duration};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000/";

pub const BACKEND_CMD_ENV: &str = "VISIONFORGE_BACKEND_CMD";
pub const BACKEND_CWD_ENV: &str = "VISIONFORGE_BACKEND_CWD";
pub const BACKEND_AUTO_START_ENV: &str = "VISIONFORGE_BACKEND_AUTO_START";

pub const DEFAULT_HEALTH_PATH: &str = "/health";
pub const HEALTH_PATH_ENV: &str = "VISIONFORGE_HEALTH_PATH";

pub const READY_TIMEOUT_ENV: &str = "VISIONFORGE_READY_TIMEOUT_MS";
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 15_000;
pub const READY_TIMEOUT_MIN_MS: u64 = 1_000;
pub const READY_TIMEOUT_MAX_MS: u64 = 10 * 60 * 1000;

pub const READY_POLL_INTERVAL_ENV: &str = "VISIONFORGE_READY_POLL_INTERVAL_MS";
pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 300;
pub const READY_POLL_INTERVAL_MIN_MS: u64 = 50;
pub const READY_POLL_INTERVAL_MAX_MS: u64 = 10_000;

pub const READY_PROBE_TIMEOUT_ENV: &str = "VISIONFORGE_READY_PROBE_TIMEOUT_MS";
pub const DEFAULT_READY_PROBE_TIMEOUT_MS: u64 = 800;
pub const READY_PROBE_TIMEOUT_MIN_MS: u64 = 100;
pub const READY_PROBE_TIMEOUT_MAX_MS: u64 = 30_000;

pub const DEFAULT_GRACE_WINDOW_MS: u64 = 3_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1_500;
pub const RUNTIME_PROBE_TIMEOUT_MS: u64 = 2_000;

/// Everything the readiness prober needs, resolved once per startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub health_path: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_READY_POLL_INTERVAL_MS),
            probe_timeout: Duration::from_millis(DEFAULT_READY_PROBE_TIMEOUT_MS),
        }
    }
}

pub fn resolve_readiness_config<F>(mut log: F) -> ReadinessConfig
where
    F: FnMut(String),
{
    let health_path = resolve_health_path(HEALTH_PATH_ENV, DEFAULT_HEALTH_PATH, &mut log);
    let timeout = resolve_clamped_timeout_env(
        READY_TIMEOUT_ENV,
        DEFAULT_READY_TIMEOUT_MS,
        READY_TIMEOUT_MIN_MS,
        READY_TIMEOUT_MAX_MS,
        &mut log,
    );
    let poll_interval = resolve_clamped_timeout_env(
        READY_POLL_INTERVAL_ENV,
        DEFAULT_READY_POLL_INTERVAL_MS,
        READY_POLL_INTERVAL_MIN_MS,
        READY_POLL_INTERVAL_MAX_MS,
        &mut log,
    );
    let probe_timeout = resolve_clamped_timeout_env(
        READY_PROBE_TIMEOUT_ENV,
        DEFAULT_READY_PROBE_TIMEOUT_MS,
        READY_PROBE_TIMEOUT_MIN_MS,
        READY_PROBE_TIMEOUT_MAX_MS,
        &mut log,
    );

    ReadinessConfig {
        health_path,
        timeout: Duration::from_millis(timeout),
        poll_interval: Duration::from_millis(poll_interval),
        probe_timeout: Duration::from_millis(probe_timeout),
    }
}

pub fn auto_start_enabled() -> bool {
    env::var(BACKEND_AUTO_START_ENV).unwrap_or_else(|_| "1".to_string()) != "0"
}

pub fn resolve_health_path<F>(env_name: &str, default_path: &str, mut log: F) -> String
where
    F: FnMut(String),
{
    match env::var_os(env_name) {
        Some(raw) => match raw.to_str() {
            Some(raw_utf8) => {
                let trimmed = raw_utf8.trim();
                if trimmed.is_empty() {
                    log(format!(
                        "{env_name} is empty/whitespace, fallback to default '{default_path}'"
                    ));
                    default_path.to_string()
                } else if trimmed.starts_with('/') {
                    trimmed.to_string()
                } else {
                    let normalized = format!("/{trimmed}");
                    log(format!(
                        "{env_name} is missing leading '/': '{trimmed}', normalized to '{normalized}'"
                    ));
                    normalized
                }
            }
            None => {
                log(format!(
                    "{env_name} contains non-UTF-8 value '{}', fallback to default '{default_path}'",
                    raw.to_string_lossy()
                ));
                default_path.to_string()
            }
        },
        None => default_path.to_string(),
    }
}

fn resolve_clamped_timeout_env<F>(
    env_name: &str,
    fallback_ms: u64,
    min_ms: u64,
    max_ms: u64,
    log: F,
) -> u64
where
    F: FnMut(String),
{
    match env::var(env_name) {
        Ok(raw) => parse_clamped_timeout_env(&raw, env_name, fallback_ms, min_ms, max_ms, log),
        Err(_) => fallback_ms,
    }
}

pub fn parse_clamped_timeout_env<F>(
    raw: &str,
    env_name: &str,
    fallback_ms: u64,
    min_ms: u64,
    max_ms: u64,
    mut log: F,
) -> u64
where
    F: FnMut(String),
{
    match raw.trim().parse::<u128>() {
        Ok(parsed) if parsed > 0 => {
            if parsed < min_ms as u128 {
                log(format!(
                    "{}='{}' is below minimum {}ms, clamped to {}ms",
                    env_name, raw, min_ms, min_ms
                ));
                min_ms
            } else if parsed > max_ms as u128 {
                log(format!(
                    "{}='{}' is above maximum {}ms, clamped to {}ms",
                    env_name, raw, max_ms, max_ms
                ));
                max_ms
            } else {
                parsed as u64
            }
        }
        _ => {
            log(format!(
                "invalid {}='{}', fallback to {}ms",
                env_name, raw, fallback_ms
            ));
            fallback_ms
        }
    }
}
