//! Ambient self-health reporting: the agent's own process health, distinct
//! from `ComponentHealthScore` (the per-monitored-component score the
//! pattern/health tracker computes, which lives in `endpoint-agent-core`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub overall_health: HealthLevel,
    pub components: HashMap<String, ComponentHealth>,
    pub last_check: DateTime<Utc>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthLevel,
    pub message: String,
    pub last_check: DateTime<Utc>,
    pub metrics: HashMap<String, f32>,
}

impl HealthLevel {
    pub fn as_score(&self) -> u8 {
        match self {
            HealthLevel::Healthy => 100,
            HealthLevel::Degraded => 50,
            HealthLevel::Critical => 10,
            HealthLevel::Unknown => 0,
        }
    }
}

impl HealthStatus {
    pub fn calculate_overall_health(&mut self) {
        if self.components.is_empty() {
            self.overall_health = HealthLevel::Unknown;
            return;
        }

        let critical_count = self
            .components
            .values()
            .filter(|c| c.status == HealthLevel::Critical)
            .count();

        let degraded_count = self
            .components
            .values()
            .filter(|c| c.status == HealthLevel::Degraded)
            .count();

        self.overall_health = if critical_count > 0 {
            HealthLevel::Critical
        } else if degraded_count > 0 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };
    }
}
