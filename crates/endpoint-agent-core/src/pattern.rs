//! Pattern and health tracking: occurrence history keyed by
//! `(signal-prefix)`, threshold-triggered proactive actions, and the
//! persisted aggregate of health scores, fired correlations, and overall
//! degradation history that make up `pattern-detector.json` (§4.6).

use crate::health::{estimate_failure_date, HealthTracker};
use crate::types::{
    ComponentHealthScore, Correlation, DetectedPattern, DeviceSignature, HistoryPoint, PatternOccurrence, ProactiveAction,
    Severity, Signal, SignalCategory, Urgency,
};
use chrono::{DateTime, Duration, Utc};
use endpoint_agent_common::persistence::{atomic_write_json, load_json};
use endpoint_agent_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

const PATTERN_WINDOW_DAYS: i64 = 30;
const MIN_OCCURRENCES: u32 = 3;
const STORE_VERSION: u32 = 1;

/// Fine-grained symptom identifier for pattern occurrence counting, derived
/// from the signal's metric key rather than its coarse category — mirrors
/// `health.rs`'s `base_deduction` scheme so that e.g. three unrelated drives
/// crossing a threshold never share a bucket with each other.
fn signal_prefix(signal: &Signal) -> String {
    let metric = signal.metric.strip_prefix("eventlog:").unwrap_or(&signal.metric);
    for suffix in [":used_percent", ":total_bytes", ":state", ":start_type", ":cpu", ":memory"] {
        if let Some(rest) = metric.strip_suffix(suffix) {
            return rest.to_string();
        }
    }
    metric.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedStore {
    occurrences: Vec<PatternOccurrence>,
    detected_patterns: HashMap<String, DetectedPattern>,
    proactive_actions: Vec<ProactiveAction>,
    health_scores: HashMap<String, ComponentHealthScore>,
    correlations: Vec<Correlation>,
    degradation_history: Vec<HistoryPoint>,
    version: u32,
}

pub struct PatternHealthTracker {
    data_dir: PathBuf,
    occurrences: Vec<PatternOccurrence>,
    detected_patterns: HashMap<String, DetectedPattern>,
    proactive_actions: Vec<ProactiveAction>,
    health: HealthTracker,
    correlations: Vec<Correlation>,
    degradation_history: Vec<HistoryPoint>,
}

impl PatternHealthTracker {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            occurrences: Vec::new(),
            detected_patterns: HashMap::new(),
            proactive_actions: Vec::new(),
            health: HealthTracker::new(),
            correlations: Vec::new(),
            degradation_history: Vec::new(),
        }
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join("pattern-detector.json")
    }

    pub async fn load(&mut self) {
        if let Ok(store) = load_json::<PersistedStore>(&self.path()).await {
            self.occurrences = store.occurrences;
            self.detected_patterns = store.detected_patterns;
            self.proactive_actions = store.proactive_actions;
            self.health = HealthTracker::restore(store.health_scores);
            self.correlations = store.correlations;
            self.degradation_history = store.degradation_history;
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let store = PersistedStore {
            occurrences: self.occurrences.clone(),
            detected_patterns: self.detected_patterns.clone(),
            proactive_actions: self.proactive_actions.clone(),
            health_scores: self.health.snapshot(),
            correlations: self.correlations.clone(),
            degradation_history: self.degradation_history.clone(),
            version: STORE_VERSION,
        };
        atomic_write_json(&self.path(), &store, false).await
    }

    /// Record one signal occurrence, prune by age, and re-evaluate whether
    /// its pattern has crossed the occurrence threshold.
    pub fn record_signal(&mut self, signal: &Signal, now: DateTime<Utc>) -> Option<&ProactiveAction> {
        let prefix = signal_prefix(signal);
        self.occurrences.push(PatternOccurrence {
            signal_id: signal.id.clone(),
            category: signal.category,
            prefix: prefix.clone(),
            severity: signal.severity,
            observed_at: signal.observed_at,
            metadata: signal.metadata.clone(),
        });

        let cutoff = now - Duration::days(PATTERN_WINDOW_DAYS);
        self.occurrences.retain(|o| o.observed_at >= cutoff);

        let count = self.occurrences.iter().filter(|o| o.prefix == prefix).count() as u32;

        if count < MIN_OCCURRENCES {
            return None;
        }

        let pattern_id = format!("pattern-{prefix}");
        let is_new = !self.detected_patterns.contains_key(&pattern_id);
        let entry = self
            .detected_patterns
            .entry(pattern_id.clone())
            .or_insert_with(|| DetectedPattern {
                pattern_id: pattern_id.clone(),
                signal_prefix: prefix.clone(),
                occurrence_count: 0,
                first_seen: now,
                last_seen: now,
            });
        entry.occurrence_count = count;
        entry.last_seen = now;

        let has_pending_action = self.proactive_actions.iter().any(|a| a.pattern_id == pattern_id);
        if is_new && !has_pending_action {
            let action = ProactiveAction {
                action_id: Uuid::new_v4().to_string(),
                pattern_id: pattern_id.clone(),
                title: format!("Recurring {prefix} issue detected"),
                steps: vec![format!("Review recent {prefix} signals"), "Consider a preventive runbook".to_string()],
                urgency: urgency_for(signal.severity),
                created_at: now,
            };
            self.proactive_actions.push(action);
            return self.proactive_actions.last();
        }

        None
    }

    pub fn update_health(&mut self, component: &str, metric_prefix: &str, severity: Severity, now: DateTime<Utc>) {
        self.health.apply_signal(component, metric_prefix, severity, now);
        if let Some(score) = self.health.get(component) {
            self.degradation_history.push(HistoryPoint {
                timestamp: now,
                score: score.score,
            });
        }
    }

    pub fn health_score(&self, component: &str) -> Option<&ComponentHealthScore> {
        self.health.get(component)
    }

    pub fn estimated_failure_date(&self, component: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let score = self.health.get(component)?;
        estimate_failure_date(&score.history, now)
    }

    pub fn record_correlation(&mut self, correlation: Correlation) {
        self.correlations.push(correlation);
    }

    pub fn proactive_actions(&self) -> &[ProactiveAction] {
        &self.proactive_actions
    }

    /// Tag a signature's component for health scoring purposes — the
    /// category name, unless a more specific target exists.
    pub fn component_for(signature: &DeviceSignature) -> String {
        signature
            .targets
            .first()
            .map(|t| t.name.clone())
            .unwrap_or_else(|| format!("{:?}", signature.category).to_lowercase())
    }
}

fn urgency_for(severity: Severity) -> Urgency {
    match severity {
        Severity::Critical => Urgency::High,
        Severity::Warning => Urgency::Medium,
        Severity::Info => Urgency::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalMetadata;

    fn signal(now: DateTime<Utc>) -> Signal {
        Signal::new(
            SignalCategory::Services,
            "service:Spooler:state",
            1.0,
            0.0,
            Severity::Critical,
            SignalMetadata::Service {
                service_name: "Spooler".to_string(),
            },
            now,
        )
    }

    #[test]
    fn proactive_action_created_once_threshold_crossed() {
        let mut tracker = PatternHealthTracker::new(PathBuf::from("/tmp/unused"));
        let now = Utc::now();

        assert!(tracker.record_signal(&signal(now), now).is_none());
        assert!(tracker.record_signal(&signal(now), now).is_none());
        let action = tracker.record_signal(&signal(now), now);
        assert!(action.is_some());
        assert_eq!(tracker.proactive_actions().len(), 1);

        // A fourth occurrence does not create a second pending action.
        tracker.record_signal(&signal(now), now);
        assert_eq!(tracker.proactive_actions().len(), 1);
    }

    fn service_signal(now: DateTime<Utc>, name: &str) -> Signal {
        Signal::new(
            SignalCategory::Services,
            format!("service:{name}:state"),
            1.0,
            0.0,
            Severity::Critical,
            SignalMetadata::Service {
                service_name: name.to_string(),
            },
            now,
        )
    }

    #[test]
    fn distinct_services_in_the_same_category_do_not_share_a_pattern_bucket() {
        let mut tracker = PatternHealthTracker::new(PathBuf::from("/tmp/unused"));
        let now = Utc::now();

        assert!(tracker.record_signal(&service_signal(now, "Spooler"), now).is_none());
        assert!(tracker.record_signal(&service_signal(now, "BITS"), now).is_none());
        assert!(tracker.record_signal(&service_signal(now, "wuauserv"), now).is_none());
        assert!(tracker.proactive_actions().is_empty());

        // A third occurrence of the *same* service still crosses the threshold.
        tracker.record_signal(&service_signal(now, "Spooler"), now);
        tracker.record_signal(&service_signal(now, "Spooler"), now);
        assert_eq!(tracker.proactive_actions().len(), 1);
    }

    #[test]
    fn occurrences_older_than_window_are_pruned() {
        let mut tracker = PatternHealthTracker::new(PathBuf::from("/tmp/unused"));
        let old = Utc::now() - Duration::days(40);
        tracker.record_signal(&signal(old), old);
        let now = Utc::now();
        tracker.record_signal(&signal(now), now);

        assert_eq!(tracker.occurrences.len(), 1);
    }

    #[test]
    fn health_update_tracks_degradation_history() {
        let mut tracker = PatternHealthTracker::new(PathBuf::from("/tmp/unused"));
        let now = Utc::now();
        tracker.update_health("disk", "ecc", Severity::Critical, now);
        assert!(tracker.health_score("disk").unwrap().score < 100);
        assert_eq!(tracker.degradation_history.len(), 1);
    }

    #[tokio::test]
    async fn flush_then_load_round_trips_proactive_actions() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut tracker = PatternHealthTracker::new(dir.path().to_path_buf());
        for _ in 0..MIN_OCCURRENCES {
            tracker.record_signal(&signal(now), now);
        }
        tracker.flush().await.unwrap();

        let mut reloaded = PatternHealthTracker::new(dir.path().to_path_buf());
        reloaded.load().await;
        assert_eq!(reloaded.proactive_actions().len(), 1);
    }
}
