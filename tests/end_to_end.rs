//! Exercises the disk-escalation path end to end: a breach that requires
//! approval escalates once, repeats within the cooldown window are
//! suppressed, and a later repeat escalates again with a wider window.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use endpoint_agent_common::Result;
use endpoint_agent_core::ports::{ControlMessage, EventLogRecord, EventLogSource, MetricCollector, OutboundMessage, Transport};
use endpoint_agent_core::stubs::StubPrimitiveExecutor;
use endpoint_agent_core::types::{Sample, TicketStatus};
use endpoint_agent_core::Orchestrator;
use std::sync::{Arc, Mutex};

struct DiskBreachCollector {
    used_percent: f64,
    captured_at: DateTime<Utc>,
}

#[async_trait]
impl MetricCollector for DiskBreachCollector {
    async fn collect(&self) -> Result<Vec<Sample>> {
        Ok(vec![
            Sample {
                metric_key: "disk:C:used_percent".to_string(),
                value: self.used_percent,
                captured_at: self.captured_at,
            },
            Sample {
                metric_key: "disk:C:total_bytes".to_string(),
                value: 500_000_000_000.0,
                captured_at: self.captured_at,
            },
        ])
    }
}

struct NoEvents;

#[async_trait]
impl EventLogSource for NoEvents {
    async fn drain(&self) -> Result<Vec<EventLogRecord>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn poll_control(&self) -> Result<Vec<ControlMessage>> {
        Ok(Vec::new())
    }
}

impl RecordingTransport {
    fn escalation_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Escalation { .. }))
            .count()
    }
}

fn config(data_dir: &std::path::Path) -> endpoint_agent_common::config::Config {
    let mut config = endpoint_agent_common::config::Config::default();
    config.agent.data_dir = data_dir.to_path_buf();
    config
}

#[tokio::test]
async fn disk_breach_escalates_then_respects_and_then_grows_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(config(dir.path()), Arc::new(StubPrimitiveExecutor::default()));
    orchestrator.load().await;

    let transport = RecordingTransport::default();
    let event_log = NoEvents;
    let t0 = Utc::now();

    let collector: Arc<dyn MetricCollector> = Arc::new(DiskBreachCollector {
        used_percent: 92.0,
        captured_at: t0,
    });
    orchestrator.tick(&[collector], &event_log, Some(&transport), t0).await.unwrap();
    assert_eq!(transport.escalation_count(), 1, "first breach should escalate");

    let t1 = t0 + Duration::minutes(3);
    let collector: Arc<dyn MetricCollector> = Arc::new(DiskBreachCollector {
        used_percent: 93.0,
        captured_at: t1,
    });
    orchestrator.tick(&[collector], &event_log, Some(&transport), t1).await.unwrap();
    assert_eq!(transport.escalation_count(), 1, "repeat within cooldown should not re-escalate");

    let t2 = t0 + Duration::minutes(6);
    let collector: Arc<dyn MetricCollector> = Arc::new(DiskBreachCollector {
        used_percent: 94.0,
        captured_at: t2,
    });
    orchestrator.tick(&[collector], &event_log, Some(&transport), t2).await.unwrap();
    assert_eq!(transport.escalation_count(), 2, "repeat past cooldown should escalate again");

    let sent = transport.sent.lock().unwrap();
    let tickets: Vec<_> = sent
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Escalation { ticket, .. } => Some(ticket),
            _ => None,
        })
        .collect();
    assert_eq!(tickets.len(), 2);
    for ticket in &tickets {
        assert_eq!(ticket.status, TicketStatus::Escalated);
        assert!(ticket.escalated);
    }
}
