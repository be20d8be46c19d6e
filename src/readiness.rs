use std::time::{Duration, Instant};

use tokio::{net::TcpStream, time::timeout};
use url::Url;

use crate::config::ReadinessConfig;

/// Outcome of one readiness wait. Ephemeral, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    pub ready: bool,
    pub elapsed: Duration,
}

/// Polls the health endpoint until it answers 2xx or the timeout elapses.
/// Transport errors and non-2xx answers are expected while the backend boots
/// and are silently retried; this function never errors and always returns
/// within the timeout plus one poll interval.
pub async fn wait_until_ready<F>(
    client: &reqwest::Client,
    base_url: &str,
    config: &ReadinessConfig,
    log: F,
) -> HealthStatus
where
    F: Fn(&str) + Copy,
{
    let started = Instant::now();
    let Some(health_url) = join_health_url(base_url, &config.health_path) else {
        log(&format!(
            "cannot build health URL from base {base_url} and path {}",
            config.health_path
        ));
        return HealthStatus {
            ready: false,
            elapsed: started.elapsed(),
        };
    };

    let mut tcp_ready_logged = false;
    loop {
        if let Some(status) = probe_health(client, &health_url, config.probe_timeout).await {
            if (200..300).contains(&status) {
                log(&format!(
                    "backend ready after {}ms (status {status})",
                    started.elapsed().as_millis()
                ));
                return HealthStatus {
                    ready: true,
                    elapsed: started.elapsed(),
                };
            }
        } else if !tcp_ready_logged && ping_backend(base_url, config.probe_timeout).await {
            log("backend TCP port is reachable but the health endpoint is not answering yet");
            tcp_ready_logged = true;
        }

        if started.elapsed() >= config.timeout {
            log(&format!(
                "backend readiness check timed out after {}ms: url={health_url}, probe_timeout_ms={}, tcp_reachable={}",
                config.timeout.as_millis(),
                config.probe_timeout.as_millis(),
                tcp_ready_logged
            ));
            return HealthStatus {
                ready: false,
                elapsed: started.elapsed(),
            };
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

async fn probe_health(
    client: &reqwest::Client,
    health_url: &Url,
    probe_timeout: Duration,
) -> Option<u16> {
    let response = client
        .get(health_url.clone())
        .timeout(probe_timeout)
        .send()
        .await
        .ok()?;
    Some(response.status().as_u16())
}

/// Cheap TCP connect probe used for diagnostics while HTTP is not answering.
pub async fn ping_backend(base_url: &str, connect_timeout: Duration) -> bool {
    let Ok(parsed) = Url::parse(base_url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(80);

    matches!(
        timeout(connect_timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

fn join_health_url(base_url: &str, health_path: &str) -> Option<Url> {
    Url::parse(base_url).ok()?.join(health_path).ok()
}
