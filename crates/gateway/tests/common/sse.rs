//! Client-side SSE reader for integration tests.

use futures::StreamExt as _;
use mcp_gateway::sse::{SseDecoder, SseFrame};
use std::time::Duration;
use tokio::sync::mpsc;

/// Reads the gateway's client stream in a background task.
pub struct SseClient {
    rx: mpsc::UnboundedReceiver<SseFrame>,
}

impl SseClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let resp = reqwest::get(url).await?;
        anyhow::ensure!(
            resp.status().is_success(),
            "sse connect failed: {}",
            resp.status()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            while let Some(Ok(chunk)) = stream.next().await {
                for frame in decoder.push(&chunk) {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(Self { rx })
    }

    pub async fn next_frame(&mut self, timeout: Duration) -> anyhow::Result<SseFrame> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for SSE frame"))?
            .ok_or_else(|| anyhow::anyhow!("SSE stream ended"))
    }
}
