//! Domain entities from the data model: samples, signals, signatures,
//! tickets, runbooks, cooldowns, pattern occurrences, health scores, and
//! correlations. Metadata that the source treats as a free-form blob is a
//! tagged enum here (`SignalMetadata`), serialized so the external JSON
//! schema is unchanged.

use crate::ringbuffer::RingBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One observation of a metric, as delivered by a collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub metric_key: String,
    pub value: f64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProfileKey {
    pub hour: u8,
    pub is_weekday: bool,
}

/// Streaming mean/variance for one `(metric, hour, day-type)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileBucket {
    pub metric: String,
    pub key: ProfileKey,
    pub n: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: f64,
    pub max: f64,
    pub last_updated: DateTime<Utc>,
}

impl ProfileBucket {
    pub fn new(metric: impl Into<String>, key: ProfileKey, now: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            key,
            n: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last_updated: now,
        }
    }

    /// Variance per invariant 1: `n >= 2 => variance = m2/n >= 0`.
    pub fn variance(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.m2 / self.n as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalCategory {
    Performance,
    Storage,
    Services,
    Network,
    Processes,
    Eventlog,
}

/// Tagged metadata per signal category, in place of the source's free-form
/// map — serialized flat so external consumers see the same field names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum SignalMetadata {
    #[serde(rename = "service")]
    Service { service_name: String },
    #[serde(rename = "process")]
    Process {
        process_name: String,
        pid: Option<u32>,
    },
    #[serde(rename = "disk")]
    Disk { drive: String },
    #[serde(rename = "system")]
    System,
    #[serde(rename = "network")]
    Network { interface: Option<String> },
    #[serde(rename = "eventlog")]
    EventLog { source: String, event_id: Option<u32> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub category: SignalCategory,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub metadata: SignalMetadata,
    pub observed_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        category: SignalCategory,
        metric: impl Into<String>,
        value: f64,
        threshold: f64,
        severity: Severity,
        metadata: SignalMetadata,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category,
            metric: metric.into(),
            value,
            threshold,
            severity,
            metadata,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StableSymptom {
    pub category: SignalCategory,
    pub severity: Severity,
    pub metric: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Service,
    Process,
    System,
    Network,
    App,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceContext {
    pub os_build: String,
    pub os_version: String,
    pub device_role: String,
}

/// Stable identity of a problem class. `signature_id` is a deterministic
/// hash over `symptoms`/`targets`/`context`/`category` only — never over
/// volatile values (see `signature::generate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSignature {
    pub signature_id: String,
    pub symptoms: Vec<StableSymptom>,
    pub targets: Vec<Target>,
    pub context: DeviceContext,
    pub severity: Severity,
    pub confidence_local: u8,
    pub category: SignalCategory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Failed,
    Escalated,
}

impl TicketStatus {
    /// Whether this status is terminal (invariant 3 / invariant 5: no
    /// transition leaves a terminal state).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::Failed | TicketStatus::Escalated)
    }

    /// Whether transitioning from `self` to `next` is allowed by the DAG
    /// `open -> in-progress -> {resolved|failed|escalated}`.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Open, InProgress)
                | (Open, Resolved)
                | (Open, Failed)
                | (Open, Escalated)
                | (InProgress, Resolved)
                | (InProgress, Failed)
                | (InProgress, Escalated)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TicketResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionCategory {
    Fixed,
    Ignored,
    Protected,
    Escalated,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: String,
    pub signature_id: String,
    pub runbook_id: Option<String>,
    pub status: TicketStatus,
    pub steps_total: u32,
    pub steps_completed: u32,
    pub result: Option<TicketResult>,
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub resolution_category: Option<ResolutionCategory>,
    /// Set when the runbook-level timeout ran out before every step got a
    /// chance to run (§4.10); distinct from a single step failing outright.
    #[serde(default)]
    pub partial_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookStep {
    pub primitive: String,
    #[serde(default)]
    pub params: std::collections::HashMap<String, String>,
    pub output_key: String,
    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runbook {
    pub id: String,
    pub category: SignalCategory,
    pub timeout_ms: u64,
    pub steps: Vec<RunbookStep>,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub signature_id: String,
    pub escalation_count: u32,
    pub cooldown_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternOccurrence {
    pub signal_id: String,
    pub category: SignalCategory,
    /// Fine-grained symptom identifier the occurrence is counted under,
    /// e.g. `"disk:C"` or `"service:Spooler"` — never the coarse category.
    #[serde(default)]
    pub prefix: String,
    pub severity: Severity,
    pub observed_at: DateTime<Utc>,
    pub metadata: SignalMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthScore {
    pub component: String,
    pub score: i32,
    pub trend: Trend,
    pub factors: RingBuffer<i32>,
    pub history: RingBuffer<HistoryPoint>,
}

impl ComponentHealthScore {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            score: 100,
            trend: Trend::Stable,
            factors: RingBuffer::new(50),
            history: RingBuffer::new(500),
        }
    }
}

/// A recurring signal prefix that has crossed its occurrence threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern_id: String,
    pub signal_prefix: String,
    pub occurrence_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveAction {
    pub action_id: String,
    pub pattern_id: String,
    pub title: String,
    pub steps: Vec<String>,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub rule_id: String,
    pub signals: Vec<String>,
    pub confidence: u8,
    pub description: String,
    pub action: Option<String>,
    pub fired_at: DateTime<Utc>,
}

impl Correlation {
    #[must_use]
    pub fn new(rule_id: impl Into<String>, description: impl Into<String>, fired_at: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule_id.into(),
            signals: Vec::new(),
            confidence: 50,
            description: description.into(),
            action: None,
            fired_at,
        }
    }

    #[must_use]
    pub fn with_signal(mut self, signal_id: impl Into<String>) -> Self {
        self.signals.push(signal_id.into());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(100);
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn is_strong(&self) -> bool {
        self.confidence >= 70
    }
}

/// User-configured exclusion lists, hot-swappable via the `update-exclusions`
/// control message. Service/process matches are case-insensitive; signature
/// matches are exact (acknowledging a signature clears its cooldown).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Exclusions {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub processes: Vec<String>,
    #[serde(default)]
    pub signatures: Vec<String>,
}

impl Exclusions {
    pub fn excludes_service(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.eq_ignore_ascii_case(name))
    }

    pub fn excludes_process(&self, name: &str) -> bool {
        self.processes.iter().any(|p| p.eq_ignore_ascii_case(name))
    }

    pub fn excludes_signature(&self, signature_id: &str) -> bool {
        self.signatures.iter().any(|s| s == signature_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_bucket_variance_is_nonnegative() {
        let bucket = ProfileBucket::new("system:cpu", ProfileKey { hour: 14, is_weekday: true }, Utc::now());
        assert_eq!(bucket.variance(), 0.0);
    }

    #[test]
    fn ticket_status_transitions_are_monotonic() {
        assert!(TicketStatus::Open.can_transition_to(TicketStatus::InProgress));
        assert!(TicketStatus::InProgress.can_transition_to(TicketStatus::Resolved));
        assert!(!TicketStatus::Resolved.can_transition_to(TicketStatus::Open));
        assert!(!TicketStatus::Failed.can_transition_to(TicketStatus::InProgress));
    }

    #[test]
    fn correlation_builder_clamps_confidence() {
        let corr = Correlation::new("rule-1", "test", Utc::now())
            .with_signal("sig-1")
            .with_confidence(150);
        assert_eq!(corr.confidence, 100);
        assert!(corr.is_strong());
    }

    #[test]
    fn exclusions_match_is_case_insensitive() {
        let exclusions = Exclusions {
            services: vec!["BITS".to_string()],
            processes: Vec::new(),
            signatures: Vec::new(),
        };
        assert!(exclusions.excludes_service("bits"));
        assert!(!exclusions.excludes_service("spooler"));
    }
}
