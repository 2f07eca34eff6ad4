//! Shared helpers for integration tests.

use std::time::{Duration, Instant};

/// Poll a URL until it answers with a success status or the timeout expires.
pub async fn wait_http_ok(url: &str, timeout: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if let Ok(resp) = client.get(url).send().await
            && resp.status().is_success()
        {
            return Ok(());
        }
        if start.elapsed() > timeout {
            anyhow::bail!("timed out waiting for {url}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll a condition until it holds or the timeout expires.
pub async fn wait_for<F>(mut condition: F, timeout: Duration, what: &str) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Ok(())
}
