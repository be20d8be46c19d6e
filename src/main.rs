use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use visionforge_supervisor::{
    config, default_platform, shell_log::append_startup_log, watchdog, Supervisor,
    SupervisorOptions,
};

#[tokio::main]
async fn main() {
    let options = SupervisorOptions::from_env(append_startup_log);
    let platform = default_platform();
    let supervisor = Arc::new(Supervisor::new(options, platform.clone()));

    let outcome = supervisor.start().await;
    if outcome.is_ready() {
        println!(
            "backend ready after {}ms (attempts: {}, adopted: {})",
            outcome.health.elapsed.as_millis(),
            outcome.attempts,
            outcome.adopted
        );
    } else {
        // The shell window opens regardless; this is the degraded-mode
        // warning a real shell would show as a blocking dialog.
        match (&outcome.degraded, &outcome.log_path) {
            (Some(reason), Some(log_path)) => eprintln!(
                "warning: backend unavailable ({reason}); backend log: {}",
                log_path.display()
            ),
            (Some(reason), None) => eprintln!("warning: backend unavailable ({reason})"),
            (None, _) => eprintln!("warning: backend not confirmed ready"),
        }
    }

    // Stand-in for the shell's open-window count; a real shell decrements
    // this from its window-closed events.
    let window_count = Arc::new(AtomicUsize::new(1));
    let watchdog_handle = if cfg!(target_os = "windows") {
        match supervisor.backend_image_name().await {
            Some(image_name) => {
                let probe_count = window_count.clone();
                Some(watchdog::spawn_watchdog(
                    platform,
                    image_name,
                    Duration::from_millis(config::DEFAULT_WATCHDOG_INTERVAL_MS),
                    move || probe_count.load(Ordering::Relaxed),
                ))
            }
            None => None,
        }
    } else {
        None
    };

    if let Err(error) = tokio::signal::ctrl_c().await {
        eprintln!("failed to wait for shutdown signal: {error}");
    }

    window_count.store(0, Ordering::Relaxed);
    supervisor.shutdown().await;
    if let Some(handle) = watchdog_handle {
        handle.stop();
    }
}
