//! HTTP transport to the management server (spec §6): posts outbound
//! messages, polls for control messages, and falls back to the offline
//! pending-reports queue whenever the server can't be reached. Adapted from
//! the gateway's cloud-sync path in `mcp-queue::PersistentQueue`, but here
//! the queue is a collaborator rather than the transport's own storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use endpoint_agent_common::{Error, Result};
use endpoint_agent_core::ports::{ControlMessage, OutboundMessage, Transport};
use endpoint_agent_queue::PendingReportsQueue;
use std::time::Duration;

pub struct HttpTransport {
    client: reqwest::Client,
    server_url: Option<String>,
    queue: PendingReportsQueue,
}

impl HttpTransport {
    pub fn new(server_url: Option<String>, request_timeout_ms: u64, queue: PendingReportsQueue) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .map_err(|err| Error::FatalInit(err.to_string()))?;
        Ok(Self { client, server_url, queue })
    }

    pub async fn load(&self) {
        self.queue.load().await;
    }

    async fn post_message(&self, server_url: &str, message: &OutboundMessage) -> Result<()> {
        let response = self
            .client
            .post(format!("{server_url}/messages"))
            .json(message)
            .send()
            .await
            .map_err(|err| Error::TransientExt(err.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::TransientExt(format!("server returned {}", response.status())))
        }
    }

    /// Re-attempt every queued message, highest priority first. A message
    /// that fails again goes back on the queue with backoff; one that
    /// exhausts its retries is dropped by the queue itself.
    pub async fn flush_pending(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(server_url) = &self.server_url else {
            return Ok(0);
        };

        let mut sent = 0usize;
        for entry in self.queue.drain_ready(now).await {
            match self.post_message(server_url, &entry.message).await {
                Ok(()) => {
                    self.queue.acknowledge(&entry.id).await?;
                    sent += 1;
                }
                Err(err) => {
                    tracing::debug!(id = %entry.id, error = %err, "retry of queued report failed");
                    self.queue.record_failure(&entry.id, now).await?;
                }
            }
        }
        Ok(sent)
    }

    pub async fn cleanup_old(&self, now: DateTime<Utc>) -> Result<usize> {
        self.queue.cleanup_old(now).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    /// Try to send immediately; on failure (or with no server configured at
    /// all) the message is queued for a later retry rather than dropped.
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let now = Utc::now();
        match &self.server_url {
            Some(server_url) => match self.post_message(server_url, &message).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::debug!(error = %err, "send failed, queuing for retry");
                    self.queue.enqueue(message, now).await
                }
            },
            None => self.queue.enqueue(message, now).await,
        }
    }

    async fn poll_control(&self) -> Result<Vec<ControlMessage>> {
        let Some(server_url) = &self.server_url else {
            return Ok(Vec::new());
        };

        let response = self
            .client
            .get(format!("{server_url}/control"))
            .send()
            .await
            .map_err(|err| Error::TransientExt(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::TransientExt(format!("server returned {}", response.status())));
        }

        response.json().await.map_err(|err| Error::TransientExt(err.to_string()))
    }
}
