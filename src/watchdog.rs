use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{platform::PlatformAdapter, shell_log::append_shutdown_log};

/// Safety net for the platform where shutdown-event delivery is unreliable:
/// a fixed-interval check that issues the kill-by-image-name fallback once
/// the injected probe reports zero open windows. It may fire redundantly
/// with an already-completed shutdown without harm.
pub struct WatchdogHandle {
    stop_flag: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub fn spawn_watchdog<W>(
    platform: Arc<dyn PlatformAdapter>,
    image_name: String,
    interval: Duration,
    open_windows: W,
) -> WatchdogHandle
where
    W: Fn() -> usize + Send + Sync + 'static,
{
    let stop_flag = Arc::new(AtomicBool::new(false));
    let task_stop_flag = stop_flag.clone();
    let task = tokio::spawn(async move {
        loop {
            if task_stop_flag.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(interval).await;
            if task_stop_flag.load(Ordering::Relaxed) {
                break;
            }
            if open_windows() == 0 {
                append_shutdown_log(&format!(
                    "watchdog: no open windows, issuing image-name kill for {image_name}"
                ));
                platform.kill_by_image_name(&image_name);
            }
        }
    });

    WatchdogHandle { stop_flag, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPlatform {
        image_kills: Mutex<Vec<String>>,
    }

    impl PlatformAdapter for RecordingPlatform {
        fn candidate_runtimes(&self) -> Vec<String> {
            Vec::new()
        }

        fn terminate_gracefully(&self, _pid: u32) {}

        fn terminate_forcefully(&self, _pid: u32) {}

        fn kill_by_image_name(&self, image_name: &str) {
            self.image_kills
                .lock()
                .expect("lock kills")
                .push(image_name.to_string());
        }

        fn uses_image_name_fallback(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn watchdog_kills_by_image_name_once_windows_are_gone() {
        let platform = Arc::new(RecordingPlatform::default());
        let window_count = Arc::new(AtomicUsize::new(1));
        let probe_count = window_count.clone();

        let handle = spawn_watchdog(
            platform.clone(),
            "visionforge-backend".to_string(),
            Duration::from_millis(20),
            move || probe_count.load(Ordering::Relaxed),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(platform.image_kills.lock().expect("lock kills").is_empty());

        window_count.store(0, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let kills = platform.image_kills.lock().expect("lock kills").clone();
        assert!(!kills.is_empty());
        assert!(kills.iter().all(|name| name == "visionforge-backend"));

        handle.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn watchdog_stops_cleanly_while_windows_remain_open() {
        let platform = Arc::new(RecordingPlatform::default());
        let handle = spawn_watchdog(
            platform.clone(),
            "visionforge-backend".to_string(),
            Duration::from_millis(20),
            || 1,
        );

        handle.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_finished());
        assert!(platform.image_kills.lock().expect("lock kills").is_empty());
    }
}
