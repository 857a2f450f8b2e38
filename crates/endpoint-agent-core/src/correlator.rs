//! Signal correlator: a 30-minute sliding window of recently observed
//! signals, evaluated against a small set of compound rules on every new
//! arrival. Each rule honors its own cooldown so a persistent condition
//! doesn't refire on every tick (§4.5).

use crate::metric_store::Snapshot;
use crate::types::{Correlation, Signal, SignalCategory, SignalMetadata};
use chrono::{DateTime, Duration, Utc};
use endpoint_agent_common::config::CorrelatorConfig;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

struct WindowEntry {
    signal: Signal,
    observed_at: DateTime<Utc>,
}

pub struct Correlator {
    config: CorrelatorConfig,
    window: Mutex<VecDeque<WindowEntry>>,
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::new()),
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Record `signals` observed at `now`, prune the window, and evaluate
    /// every compound rule. Returns the correlations that fired.
    pub async fn ingest(&self, signals: Vec<Signal>, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Correlation> {
        {
            let mut window = self.window.lock().await;
            for signal in signals {
                window.push_back(WindowEntry { signal, observed_at: now });
            }
            let cutoff = now - Duration::minutes(self.config.window_minutes);
            while window.front().map(|e| e.observed_at < cutoff).unwrap_or(false) {
                window.pop_front();
            }
        }

        let window = self.window.lock().await;
        let entries: Vec<&Signal> = window.iter().map(|e| &e.signal).collect();
        drop(window);

        let mut fired = Vec::new();
        for candidate in [
            self.cpu_crashing_process(&entries, now).await,
            self.memory_critical_process(&entries, now).await,
            self.disk_with_update_service(&entries, snapshot, now).await,
            self.stopped_service_cascade(&entries, now).await,
            self.network_full_reset(&entries, now).await,
        ] {
            if let Some(correlation) = candidate {
                fired.push(correlation);
            }
        }
        fired
    }

    async fn try_fire(&self, rule_id: &str, now: DateTime<Utc>, cooldown_minutes: i64) -> bool {
        let mut last_fired = self.last_fired.lock().await;
        if let Some(last) = last_fired.get(rule_id) {
            if now - *last < Duration::minutes(cooldown_minutes) {
                return false;
            }
        }
        last_fired.insert(rule_id.to_string(), now);
        true
    }

    async fn cpu_crashing_process(&self, window: &[&Signal], now: DateTime<Utc>) -> Option<Correlation> {
        let cpu_critical = window
            .iter()
            .find(|s| s.category == SignalCategory::Performance && s.metric == "system:cpu")?;
        let process_cpu = window.iter().find(|s| s.metric == "process_cpu")?;

        if !self.try_fire("cpu-crashing-process", now, 10).await {
            return None;
        }

        Some(
            Correlation::new("cpu-crashing-process", "CPU critical coincides with a runaway process", now)
                .with_signal(cpu_critical.id.clone())
                .with_signal(process_cpu.id.clone())
                .with_confidence(95)
                .with_action("targeted-process-kill"),
        )
    }

    async fn memory_critical_process(&self, window: &[&Signal], now: DateTime<Utc>) -> Option<Correlation> {
        let memory_critical = window
            .iter()
            .find(|s| s.category == SignalCategory::Performance && s.metric == "system:memory")?;
        let process_memory = window.iter().find(|s| s.metric == "process_memory")?;

        if !self.try_fire("memory-critical-process", now, 10).await {
            return None;
        }

        Some(
            Correlation::new(
                "memory-critical-process",
                "Memory critical coincides with a leaking process",
                now,
            )
            .with_signal(memory_critical.id.clone())
            .with_signal(process_memory.id.clone())
            .with_confidence(95)
            .with_action("targeted-process-restart"),
        )
    }

    async fn disk_with_update_service(
        &self,
        window: &[&Signal],
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Option<Correlation> {
        let disk_signal = window.iter().find(|s| s.category == SignalCategory::Storage)?;
        let update_running = snapshot
            .get("service:wuauserv:state")
            .map(|entry| entry.sample.value < 0.5)
            .unwrap_or(false);
        if !update_running {
            return None;
        }

        if !self.try_fire("disk-with-update-service", now, 10).await {
            return None;
        }

        Some(
            Correlation::new(
                "disk-with-update-service",
                "Low disk space coincides with Windows Update running",
                now,
            )
            .with_signal(disk_signal.id.clone())
            .with_confidence(50 + 25)
            .with_action("clear-update-cache-first"),
        )
    }

    async fn stopped_service_cascade(&self, window: &[&Signal], now: DateTime<Utc>) -> Option<Correlation> {
        let mut distinct_names: Vec<&str> = Vec::new();
        let mut ids = Vec::new();
        for signal in window.iter().filter(|s| s.category == SignalCategory::Services) {
            if let SignalMetadata::Service { service_name } = &signal.metadata {
                if !distinct_names.iter().any(|n| n.eq_ignore_ascii_case(service_name)) {
                    distinct_names.push(service_name);
                    ids.push(signal.id.clone());
                }
            }
        }
        if distinct_names.len() < 2 {
            return None;
        }

        if !self.try_fire("stopped-service-cascade", now, self.config.default_rule_cooldown_minutes).await {
            return None;
        }

        let mut correlation = Correlation::new(
            "stopped-service-cascade",
            format!("{} distinct services stopped: possible cascade", distinct_names.len()),
            now,
        )
        .with_confidence(80);
        for id in ids {
            correlation = correlation.with_signal(id);
        }
        Some(correlation)
    }

    async fn network_full_reset(&self, window: &[&Signal], now: DateTime<Utc>) -> Option<Correlation> {
        const NETWORK_METRICS: [&str; 3] = ["network:dns", "network:gateway", "network:connectivity"];
        let mut matched: Vec<&Signal> = Vec::new();
        for metric in NETWORK_METRICS {
            if let Some(signal) = window.iter().find(|s| s.category == SignalCategory::Network && s.metric == metric) {
                matched.push(signal);
            }
        }
        if matched.len() < 2 {
            return None;
        }

        if !self.try_fire("full-network-reset", now, self.config.default_rule_cooldown_minutes).await {
            return None;
        }

        let mut correlation = Correlation::new(
            "full-network-reset",
            "Multiple network failure signals observed together",
            now,
        )
        .with_confidence(90)
        .with_action("full-network-reset");
        for signal in matched {
            correlation = correlation.with_signal(signal.id.clone());
        }
        Some(correlation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric_store::MetricStore;
    use crate::types::{Sample, Severity};
    use endpoint_agent_common::config::Config;

    fn correlator() -> Correlator {
        Correlator::new(Config::default().correlator)
    }

    fn cpu_signal(now: DateTime<Utc>) -> Signal {
        Signal::new(
            SignalCategory::Performance,
            "system:cpu",
            95.0,
            90.0,
            Severity::Critical,
            SignalMetadata::System,
            now,
        )
    }

    fn process_cpu_signal(now: DateTime<Utc>, name: &str) -> Signal {
        Signal::new(
            SignalCategory::Processes,
            "process_cpu",
            85.0,
            80.0,
            Severity::Warning,
            SignalMetadata::Process {
                process_name: name.to_string(),
                pid: None,
            },
            now,
        )
    }

    #[tokio::test]
    async fn cpu_and_process_cpu_fire_boosted_correlation() {
        let correlator = correlator();
        let now = Utc::now();
        let snapshot = MetricStore::new().snapshot().await;

        let fired = correlator
            .ingest(vec![cpu_signal(now), process_cpu_signal(now, "chrome.exe")], &snapshot, now)
            .await;

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].confidence, 95);
        assert_eq!(fired[0].action.as_deref(), Some("targeted-process-kill"));
    }

    #[tokio::test]
    async fn same_rule_does_not_refire_within_cooldown() {
        let correlator = correlator();
        let now = Utc::now();
        let snapshot = MetricStore::new().snapshot().await;

        let first = correlator
            .ingest(vec![cpu_signal(now), process_cpu_signal(now, "chrome.exe")], &snapshot, now)
            .await;
        assert_eq!(first.len(), 1);

        let later = now + Duration::minutes(5);
        let second = correlator
            .ingest(vec![cpu_signal(later), process_cpu_signal(later, "chrome.exe")], &snapshot, later)
            .await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn rule_refires_after_cooldown_elapses() {
        let correlator = correlator();
        let now = Utc::now();
        let snapshot = MetricStore::new().snapshot().await;

        correlator
            .ingest(vec![cpu_signal(now), process_cpu_signal(now, "chrome.exe")], &snapshot, now)
            .await;

        let later = now + Duration::minutes(11);
        let fired = correlator
            .ingest(vec![cpu_signal(later), process_cpu_signal(later, "chrome.exe")], &snapshot, later)
            .await;
        assert_eq!(fired.len(), 1);
    }

    #[tokio::test]
    async fn two_distinct_stopped_services_trigger_cascade() {
        let correlator = correlator();
        let now = Utc::now();
        let snapshot = MetricStore::new().snapshot().await;

        let s1 = Signal::new(
            SignalCategory::Services,
            "service:Spooler:state",
            1.0,
            0.0,
            Severity::Critical,
            SignalMetadata::Service {
                service_name: "Spooler".to_string(),
            },
            now,
        );
        let s2 = Signal::new(
            SignalCategory::Services,
            "service:BITS:state",
            1.0,
            0.0,
            Severity::Critical,
            SignalMetadata::Service {
                service_name: "BITS".to_string(),
            },
            now,
        );

        let fired = correlator.ingest(vec![s1, s2], &snapshot, now).await;
        assert!(fired.iter().any(|c| c.rule_id == "stopped-service-cascade"));
    }

    #[tokio::test]
    async fn disk_signal_with_update_service_running_boosts_confidence() {
        let correlator = correlator();
        let now = Utc::now();
        let store = MetricStore::new();
        store
            .put(Sample {
                metric_key: "service:wuauserv:state".to_string(),
                value: 0.0,
                captured_at: now,
            })
            .await;
        let snapshot = store.snapshot().await;

        let disk_signal = Signal::new(
            SignalCategory::Storage,
            "disk:C:used_percent",
            92.0,
            85.0,
            Severity::Warning,
            SignalMetadata::Disk { drive: "C".to_string() },
            now,
        );

        let fired = correlator.ingest(vec![disk_signal], &snapshot, now).await;
        assert!(fired.iter().any(|c| c.rule_id == "disk-with-update-service" && c.confidence == 75));
    }

    #[tokio::test]
    async fn entries_outside_window_are_pruned() {
        let correlator = correlator();
        let now = Utc::now();
        let snapshot = MetricStore::new().snapshot().await;

        correlator.ingest(vec![cpu_signal(now)], &snapshot, now).await;
        let much_later = now + Duration::minutes(31);
        correlator
            .ingest(vec![process_cpu_signal(much_later, "chrome.exe")], &snapshot, much_later)
            .await;

        let window = correlator.window.lock().await;
        assert!(window.iter().all(|e| e.observed_at >= much_later - Duration::minutes(30)));
    }
}
