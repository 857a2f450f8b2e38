//! Trait surface the core depends on but does not implement: host metric
//! collection, remediation primitives, event-log draining, and transport.
//! Each is an external collaborator per the scope notes; the workspace
//! ships one minimal, host-agnostic implementation of each (see
//! `stubs.rs`) so the binary runs standalone.

use crate::types::{DeviceSignature, Ticket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use endpoint_agent_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Sample;

#[async_trait]
pub trait MetricCollector: Send + Sync {
    async fn collect(&self) -> Result<Vec<Sample>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimitiveParams {
    pub values: HashMap<String, String>,
}

impl PrimitiveParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait PrimitiveExecutor: Send + Sync {
    async fn execute(&self, op: &str, params: &PrimitiveParams) -> Result<PrimitiveOutcome>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRecord {
    pub source: String,
    pub event_id: Option<u32>,
    pub level: EventLogLevel,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventLogLevel {
    Error,
    Warning,
    Information,
}

#[async_trait]
pub trait EventLogSource: Send + Sync {
    async fn drain(&self) -> Result<Vec<EventLogRecord>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    Escalation {
        signature: DeviceSignature,
        ticket: Ticket,
        diagnostic_data: Option<serde_json::Value>,
    },
    MetricReport {
        snapshot: serde_json::Value,
        dashboard_summary: serde_json::Value,
    },
    TicketUpdate {
        ticket: Ticket,
    },
    CorrelationFired {
        rule_id: String,
        confidence: u8,
        description: String,
    },
    PatternDetected {
        pattern_id: String,
        description: String,
    },
    ProactiveActionCreated {
        action_id: String,
        title: String,
    },
    HealthScoreUpdate {
        component: String,
        score: i32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    UpdateRunbooks { runbooks_json: String },
    UpdateExclusions { exclusions_json: String },
    AcknowledgeSignature { signature_id: String },
    ApproveTicket { ticket_id: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<()>;
    async fn poll_control(&self) -> Result<Vec<ControlMessage>>;
}
