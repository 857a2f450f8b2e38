//! Agent configuration: data directory, tick cadence, and per-component
//! thresholds, loadable from TOML with sane standalone defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub profiler: ProfilerConfig,
    pub rules: RulesConfig,
    pub correlator: CorrelatorConfig,
    pub cooldown: CooldownConfig,
    pub executor: ExecutorConfig,
    pub transport: TransportConfig,
    pub queue: QueueConfig,
}

/// Top-level process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub tick_interval_ms: u64,
    pub shutdown_grace_period_ms: u64,
    pub device_role: String,
    pub os_build: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    pub min_samples: u32,
    pub z_threshold: f64,
    pub flush_interval_ms: u64,
    pub top_process_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    pub cpu_critical_percent: f64,
    pub memory_critical_percent: f64,
    pub disk_warning_percent: f64,
    pub disk_min_total_bytes: u64,
    pub process_cpu_warning_percent: f64,
    pub process_memory_warning_mb: f64,
    pub excluded_disk_letters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    pub window_minutes: i64,
    pub default_rule_cooldown_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub initial_minutes: i64,
    pub steps_minutes: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub step_timeout_ms: u64,
    pub runbook_timeout_ms: u64,
    pub auto_close_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub server_url: Option<String>,
    pub request_timeout_ms: u64,
    pub diagnostic_timeout_ms: u64,
}

/// Offline pending-reports queue: outbound messages held back when the
/// transport can't reach the server, re-sent in priority order on reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_queue_size: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_age_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                data_dir: PathBuf::from("./data"),
                tick_interval_ms: 30_000,
                shutdown_grace_period_ms: 5_000,
                device_role: "workstation".to_string(),
                os_build: "unknown".to_string(),
                os_version: "unknown".to_string(),
            },
            profiler: ProfilerConfig {
                min_samples: 50,
                z_threshold: 2.5,
                flush_interval_ms: 5 * 60 * 1000,
                top_process_count: 20,
            },
            rules: RulesConfig {
                cpu_critical_percent: 90.0,
                memory_critical_percent: 90.0,
                disk_warning_percent: 85.0,
                disk_min_total_bytes: 1024 * 1024 * 1024,
                process_cpu_warning_percent: 80.0,
                process_memory_warning_mb: 2048.0,
                excluded_disk_letters: Vec::new(),
            },
            correlator: CorrelatorConfig {
                window_minutes: 30,
                default_rule_cooldown_minutes: 10,
            },
            cooldown: CooldownConfig {
                initial_minutes: 5,
                steps_minutes: vec![5, 15, 30, 60, 120],
            },
            executor: ExecutorConfig {
                step_timeout_ms: 30_000,
                runbook_timeout_ms: 120_000,
                auto_close_delay_ms: 5_000,
            },
            transport: TransportConfig {
                server_url: None,
                request_timeout_ms: 15_000,
                diagnostic_timeout_ms: 15_000,
            },
            queue: QueueConfig {
                max_queue_size: 10_000,
                max_retries: 5,
                retry_base_delay_ms: 1_000,
                retry_max_delay_ms: 3_600_000,
                max_age_hours: 24,
            },
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults for any field the
    /// file omits is not supported by `toml`'s flat model, so the file must
    /// be a full document; `Config::default()` is the template to start from.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(Error::Io)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cooldown_steps_match_spec() {
        let config = Config::default();
        assert_eq!(config.cooldown.steps_minutes, vec![5, 15, 30, 60, 120]);
    }

    #[tokio::test]
    async fn load_round_trips_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let default = Config::default();
        tokio::fs::write(&path, toml::to_string_pretty(&default).unwrap())
            .await
            .unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.profiler.min_samples, default.profiler.min_samples);
    }
}
