//! Threshold and composition rule engine. Consumes a `Snapshot` and emits
//! zero or more `Signal`s per tick; numeric performance signals are
//! profile-gated, service and disk signals are not (§4.3).
//!
//! Metric key convention used across the snapshot:
//! `system:cpu`, `system:memory`, `disk:<letter>:used_percent`,
//! `disk:<letter>:total_bytes`, `service:<name>:state` (0=running,
//! 1=stopped), `service:<name>:start_type` (0=automatic, 1=manual/other),
//! `process:<name>:cpu`, `process:<name>:memory_mb`.

use crate::metric_store::Snapshot;
use crate::profiler::Profiler;
use crate::protected::is_protected_process;
use crate::types::{Exclusions, Severity, Signal, SignalCategory, SignalMetadata};
use chrono::{DateTime, Utc};
use endpoint_agent_common::config::RulesConfig;

pub struct RuleEngine {
    config: RulesConfig,
}

impl RuleEngine {
    pub fn new(config: RulesConfig) -> Self {
        Self { config }
    }

    /// Evaluate every representative rule against the snapshot, suppressing
    /// numeric performance signals the profiler says are within normal for
    /// this time slot.
    pub async fn evaluate(
        &self,
        snapshot: &Snapshot,
        profiler: &Profiler,
        exclusions: &Exclusions,
        top_cpu_process: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        if let Some(entry) = snapshot.get("system:cpu") {
            if entry.sample.value > self.config.cpu_critical_percent
                && self.passes_profiler(profiler, "system:cpu", entry.sample.value, now).await
            {
                let target = top_cpu_process
                    .filter(|name| !is_protected_process(name))
                    .map(|name| name.to_string())
                    .unwrap_or_default();
                signals.push(Signal::new(
                    SignalCategory::Performance,
                    "system:cpu",
                    entry.sample.value,
                    self.config.cpu_critical_percent,
                    Severity::Critical,
                    SignalMetadata::Process {
                        process_name: target,
                        pid: None,
                    },
                    now,
                ));
            }
        }

        if let Some(entry) = snapshot.get("system:memory") {
            if entry.sample.value > self.config.memory_critical_percent
                && self
                    .passes_profiler(profiler, "system:memory", entry.sample.value, now)
                    .await
            {
                signals.push(Signal::new(
                    SignalCategory::Performance,
                    "system:memory",
                    entry.sample.value,
                    self.config.memory_critical_percent,
                    Severity::Critical,
                    SignalMetadata::System,
                    now,
                ));
            }
        }

        for (letter, used_percent) in self.disk_candidates(snapshot) {
            signals.push(Signal::new(
                SignalCategory::Storage,
                format!("disk:{letter}:used_percent"),
                used_percent,
                self.config.disk_warning_percent,
                Severity::Warning,
                SignalMetadata::Disk { drive: letter },
                now,
            ));
        }

        for name in self.stopped_service_candidates(snapshot, exclusions) {
            signals.push(Signal::new(
                SignalCategory::Services,
                format!("service:{name}:state"),
                1.0,
                0.0,
                Severity::Critical,
                SignalMetadata::Service { service_name: name },
                now,
            ));
        }

        for (name, cpu) in self.process_cpu_candidates(snapshot) {
            if self.passes_profiler(profiler, &format!("process:{name}:cpu"), cpu, now).await {
                signals.push(Signal::new(
                    SignalCategory::Processes,
                    "process_cpu",
                    cpu,
                    self.config.process_cpu_warning_percent,
                    Severity::Warning,
                    SignalMetadata::Process {
                        process_name: name,
                        pid: None,
                    },
                    now,
                ));
            }
        }

        for (name, mem_mb) in self.process_memory_candidates(snapshot) {
            if self
                .passes_profiler(profiler, &format!("process:{name}:memory"), mem_mb, now)
                .await
            {
                signals.push(Signal::new(
                    SignalCategory::Processes,
                    "process_memory",
                    mem_mb,
                    self.config.process_memory_warning_mb,
                    Severity::Warning,
                    SignalMetadata::Process {
                        process_name: name,
                        pid: None,
                    },
                    now,
                ));
            }
        }

        signals
    }

    /// A signal is emitted unless the profiler judges it within normal for
    /// this time slot; with no baseline yet (`InsufficientData`) it is not
    /// suppressed.
    async fn passes_profiler(&self, profiler: &Profiler, metric: &str, value: f64, now: DateTime<Utc>) -> bool {
        use crate::profiler::Verdict;
        !matches!(
            profiler.is_anomalous(metric, value, now).await,
            Verdict::WithinNormal | Verdict::WithinNormalCrossDayFallback | Verdict::WithinNormalMonthlyFallback
        )
    }

    fn disk_candidates(&self, snapshot: &Snapshot) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for (key, entry) in snapshot.iter() {
            let Some(letter) = key.strip_prefix("disk:").and_then(|s| s.strip_suffix(":used_percent")) else {
                continue;
            };
            if self
                .config
                .excluded_disk_letters
                .iter()
                .any(|l| l.eq_ignore_ascii_case(letter))
            {
                continue;
            }
            if let Some(total) = snapshot.get(&format!("disk:{letter}:total_bytes")) {
                if (total.sample.value as u64) < self.config.disk_min_total_bytes {
                    continue;
                }
            } else {
                continue;
            }
            if entry.sample.value > self.config.disk_warning_percent {
                out.push((letter.to_string(), entry.sample.value));
            }
        }
        out
    }

    fn stopped_service_candidates(&self, snapshot: &Snapshot, exclusions: &Exclusions) -> Vec<String> {
        let mut out = Vec::new();
        for (key, entry) in snapshot.iter() {
            let Some(name) = key.strip_prefix("service:").and_then(|s| s.strip_suffix(":state")) else {
                continue;
            };
            if exclusions.excludes_service(name) {
                continue;
            }
            let stopped = entry.sample.value > 0.5;
            if !stopped {
                continue;
            }
            let automatic = snapshot
                .get(&format!("service:{name}:start_type"))
                .map(|e| e.sample.value < 0.5)
                .unwrap_or(false);
            if automatic {
                out.push(name.to_string());
            }
        }
        out
    }

    fn process_cpu_candidates(&self, snapshot: &Snapshot) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for (key, entry) in snapshot.iter() {
            let Some(name) = key.strip_prefix("process:").and_then(|s| s.strip_suffix(":cpu")) else {
                continue;
            };
            if is_protected_process(name) {
                continue;
            }
            if entry.sample.value > self.config.process_cpu_warning_percent {
                out.push((name.to_string(), entry.sample.value));
            }
        }
        out
    }

    fn process_memory_candidates(&self, snapshot: &Snapshot) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for (key, entry) in snapshot.iter() {
            let Some(name) = key.strip_prefix("process:").and_then(|s| s.strip_suffix(":memory_mb")) else {
                continue;
            };
            if is_protected_process(name) {
                continue;
            }
            if entry.sample.value > self.config.process_memory_warning_mb {
                out.push((name.to_string(), entry.sample.value));
            }
        }
        out
    }
}
