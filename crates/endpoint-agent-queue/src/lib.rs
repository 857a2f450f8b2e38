//! Offline pending-reports queue (spec §6): outbound transport messages
//! queued when the server is unreachable and re-sent, highest priority
//! first, on reconnect. Adapted from the gateway's `PersistentQueue`, with
//! the storage engine swapped from `sled`+`bincode` for the JSON
//! atomic-write helper every other persisted file in the workspace uses —
//! the entry/priority/backoff logic is otherwise unchanged.

use chrono::{DateTime, Duration, Utc};
use endpoint_agent_common::config::QueueConfig;
use endpoint_agent_common::persistence::{atomic_write_json, load_json};
use endpoint_agent_common::{Error, Result};
use endpoint_agent_core::ports::OutboundMessage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub message: OutboundMessage,
    pub priority: u8,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_retry: Option<DateTime<Utc>>,
    pub next_retry: Option<DateTime<Utc>>,
}

/// Lower values are sent first. Escalations matter most; periodic metric
/// reports are the most expendable if the queue is under pressure.
fn priority_for(message: &OutboundMessage) -> u8 {
    match message {
        OutboundMessage::Escalation { .. } => 0,
        OutboundMessage::TicketUpdate { .. } => 1,
        OutboundMessage::CorrelationFired { .. } => 2,
        OutboundMessage::PatternDetected { .. } | OutboundMessage::ProactiveActionCreated { .. } | OutboundMessage::HealthScoreUpdate { .. } => 3,
        OutboundMessage::MetricReport { .. } => 4,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Persisted {
    entries: Vec<QueueEntry>,
    #[serde(rename = "nextSequence")]
    next_sequence: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatistics {
    pub current_size: usize,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

struct State {
    entries: Vec<QueueEntry>,
    next_sequence: u64,
}

pub struct PendingReportsQueue {
    path: PathBuf,
    config: QueueConfig,
    state: Mutex<State>,
}

impl PendingReportsQueue {
    pub fn new(data_dir: PathBuf, config: QueueConfig) -> Self {
        Self {
            path: data_dir.join("pending-reports.json"),
            config,
            state: Mutex::new(State {
                entries: Vec::new(),
                next_sequence: 1,
            }),
        }
    }

    pub async fn load(&self) {
        let Ok(persisted) = load_json::<Persisted>(&self.path).await else { return };
        let mut state = self.state.lock().await;
        state.entries = persisted.entries;
        state.next_sequence = persisted.next_sequence;
    }

    async fn save(&self, state: &State) -> Result<()> {
        let persisted = Persisted {
            entries: state.entries.clone(),
            next_sequence: state.next_sequence,
        };
        atomic_write_json(&self.path, &persisted, false).await
    }

    /// Queue `message` for later delivery. Rejects once the queue is at
    /// capacity rather than growing unbounded while the server is down.
    pub async fn enqueue(&self, message: OutboundMessage, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.entries.len() >= self.config.max_queue_size as usize {
            tracing::warn!(size = state.entries.len(), "pending-reports queue at capacity, dropping message");
            return Err(Error::TransientExt("pending-reports queue at capacity".to_string()));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let priority = priority_for(&message);
        let entry = QueueEntry {
            id: format!("{:03}{:016}", priority, sequence),
            message,
            priority,
            retry_count: 0,
            created_at: now,
            last_retry: None,
            next_retry: None,
        };
        state.entries.push(entry);
        self.save(&state).await
    }

    /// Every entry currently eligible for a retry, in priority then
    /// insertion order — the order the transport should attempt re-sends.
    pub async fn drain_ready(&self, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        let mut ready: Vec<QueueEntry> = state
            .entries
            .iter()
            .filter(|entry| entry.next_retry.map_or(true, |next| next <= now))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    /// A send succeeded: remove the entry for good.
    pub async fn acknowledge(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|entry| entry.id != id);
        if state.entries.len() != before {
            self.save(&state).await?;
        }
        Ok(())
    }

    /// A send failed: bump the retry count and schedule the next attempt
    /// with exponential backoff, or drop the entry once retries run out.
    pub async fn record_failure(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.iter_mut().find(|entry| entry.id == id) else {
            return Ok(());
        };

        entry.retry_count += 1;
        entry.last_retry = Some(now);

        if entry.retry_count >= self.config.max_retries {
            tracing::warn!(id, retry_count = entry.retry_count, "dropping pending report after exhausting retries");
            state.entries.retain(|e| e.id != id);
        } else {
            entry.next_retry = Some(now + self.retry_delay(entry.retry_count));
        }
        self.save(&state).await
    }

    fn retry_delay(&self, retry_count: u32) -> Duration {
        let delay_ms = self
            .config
            .retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count))
            .min(self.config.retry_max_delay_ms);
        Duration::milliseconds(delay_ms as i64)
    }

    /// Drop entries older than `max_age_hours`, regardless of retry state —
    /// a report this stale is no longer actionable.
    pub async fn cleanup_old(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let cutoff = now - Duration::hours(self.config.max_age_hours);
        let before = state.entries.len();
        state.entries.retain(|entry| entry.created_at >= cutoff);
        let removed = before - state.entries.len();
        if removed > 0 {
            self.save(&state).await?;
        }
        Ok(removed)
    }

    pub async fn statistics(&self) -> QueueStatistics {
        let state = self.state.lock().await;
        QueueStatistics {
            current_size: state.entries.len(),
            oldest_entry: state.entries.iter().map(|e| e.created_at).min(),
            newest_entry: state.entries.iter().map(|e| e.created_at).max(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            max_queue_size: 3,
            max_retries: 2,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            max_age_hours: 24,
        }
    }

    fn ticket_update() -> OutboundMessage {
        OutboundMessage::TicketUpdate {
            ticket: endpoint_agent_core::types::Ticket {
                ticket_id: "ticket-1".to_string(),
                signature_id: "sig-1".to_string(),
                runbook_id: None,
                status: endpoint_agent_core::types::TicketStatus::Open,
                steps_total: 0,
                steps_completed: 0,
                result: None,
                escalated: false,
                created_at: Utc::now(),
                resolved_at: None,
                duration_ms: None,
                error: None,
                resolution_category: None,
            },
        }
    }

    #[tokio::test]
    async fn enqueue_then_drain_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingReportsQueue::new(dir.path().to_path_buf(), config());
        let now = Utc::now();

        queue.enqueue(ticket_update(), now).await.unwrap();
        let ready = queue.drain_ready(now).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].priority, 1);
    }

    #[tokio::test]
    async fn escalations_sort_ahead_of_metric_reports() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingReportsQueue::new(dir.path().to_path_buf(), config());
        let now = Utc::now();

        queue
            .enqueue(OutboundMessage::MetricReport { snapshot: serde_json::json!({}), dashboard_summary: serde_json::json!({}) }, now)
            .await
            .unwrap();
        queue
            .enqueue(
                OutboundMessage::Escalation {
                    signature: test_signature(),
                    ticket: match ticket_update() {
                        OutboundMessage::TicketUpdate { ticket } => ticket,
                        _ => unreachable!(),
                    },
                    diagnostic_data: None,
                },
                now,
            )
            .await
            .unwrap();

        let ready = queue.drain_ready(now).await;
        assert_eq!(ready.len(), 2);
        assert!(matches!(ready[0].message, OutboundMessage::Escalation { .. }));
    }

    fn test_signature() -> endpoint_agent_core::types::DeviceSignature {
        endpoint_agent_core::types::DeviceSignature {
            signature_id: "sig-1".to_string(),
            symptoms: vec![],
            targets: vec![],
            context: endpoint_agent_core::types::DeviceContext {
                os_build: "22631".to_string(),
                os_version: "10.0".to_string(),
                device_role: "workstation".to_string(),
            },
            severity: endpoint_agent_core::types::Severity::Critical,
            confidence_local: 90,
            category: endpoint_agent_core::types::SignalCategory::Services,
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_once_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingReportsQueue::new(dir.path().to_path_buf(), config());
        let now = Utc::now();

        for _ in 0..3 {
            queue.enqueue(ticket_update(), now).await.unwrap();
        }
        let result = queue.enqueue(ticket_update(), now).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn record_failure_schedules_backoff_then_drops_after_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingReportsQueue::new(dir.path().to_path_buf(), config());
        let now = Utc::now();
        queue.enqueue(ticket_update(), now).await.unwrap();
        let id = queue.drain_ready(now).await[0].id.clone();

        queue.record_failure(&id, now).await.unwrap();
        assert!(queue.drain_ready(now).await.is_empty());
        assert_eq!(queue.len().await, 1);

        queue.record_failure(&id, now).await.unwrap();
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn acknowledge_removes_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingReportsQueue::new(dir.path().to_path_buf(), config());
        let now = Utc::now();
        queue.enqueue(ticket_update(), now).await.unwrap();
        let id = queue.drain_ready(now).await[0].id.clone();

        queue.acknowledge(&id).await.unwrap();
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn cleanup_old_prunes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingReportsQueue::new(dir.path().to_path_buf(), config());
        let old = Utc::now() - Duration::hours(48);
        queue.enqueue(ticket_update(), old).await.unwrap();
        queue.enqueue(ticket_update(), Utc::now()).await.unwrap();

        let removed = queue.cleanup_old(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn load_restores_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let queue = PendingReportsQueue::new(dir.path().to_path_buf(), config());
            queue.enqueue(ticket_update(), now).await.unwrap();
        }

        let reloaded = PendingReportsQueue::new(dir.path().to_path_buf(), config());
        reloaded.load().await;
        assert_eq!(reloaded.len().await, 1);
    }
}
