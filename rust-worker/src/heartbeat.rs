//! Liveness heartbeat - pings an uptime monitor every polling interval.

use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Send one heartbeat. Returns whether the monitor answered with success.
pub async fn ping(client: &Client, url: &str) -> bool {
    debug!(url = %url, "heartbeat_sending");

    match client.get(url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if !status.is_success() {
                warn!(url = %url, status_code = status.as_u16(), "heartbeat_rejected");
            }
            status.is_success()
        }
        Err(e) => {
            warn!(url = %url, error = %e, "heartbeat_failed");
            false
        }
    }
}

/// Ping `url` now and then once per `interval`, forever. Failures are logged
/// and otherwise ignored.
pub fn spawn(client: Client, url: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            ping(&client, &url).await;
            sleep(interval).await;
        }
    })
}
