//! Cooldown / dampening gate: suppresses repeat escalations for the same
//! signature, the window doubling-ish through a fixed step sequence of
//! 5/15/30/60/120 minutes, capped at the final step (§4.9).

use chrono::{DateTime, Duration, Utc};
use endpoint_agent_common::config::CooldownConfig;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    escalation_count: u32,
    cooldown_until: DateTime<Utc>,
}

pub struct CooldownGate {
    steps: Vec<i64>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CooldownGate {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            steps: config.steps_minutes,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn step_minutes(&self, index: usize) -> i64 {
        let idx = index.min(self.steps.len().saturating_sub(1));
        self.steps.get(idx).copied().unwrap_or(120)
    }

    /// `true` if a new escalation for `signature_id` is allowed right now;
    /// records the escalation and advances the cooldown window either way
    /// an entry needs to exist.
    pub async fn should_escalate(&self, signature_id: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(signature_id) {
            None => {
                entries.insert(
                    signature_id.to_string(),
                    Entry {
                        escalation_count: 1,
                        cooldown_until: now + Duration::minutes(self.step_minutes(0)),
                    },
                );
                true
            }
            Some(entry) => {
                if now < entry.cooldown_until {
                    false
                } else {
                    entry.escalation_count += 1;
                    let step = self.step_minutes(entry.escalation_count as usize - 1);
                    entry.cooldown_until = now + Duration::minutes(step);
                    true
                }
            }
        }
    }

    /// Wipe cooldown state for `signature_id` — used when an operator
    /// acknowledges the underlying condition.
    pub async fn clear(&self, signature_id: &str) {
        self.entries.lock().await.remove(signature_id);
    }

    pub async fn cooldown_until(&self, signature_id: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(signature_id).map(|e| e.cooldown_until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_agent_common::config::Config;

    fn gate() -> CooldownGate {
        CooldownGate::new(Config::default().cooldown)
    }

    #[tokio::test]
    async fn first_escalation_always_allowed() {
        let gate = gate();
        let now = Utc::now();
        assert!(gate.should_escalate("sig-1", now).await);
    }

    #[tokio::test]
    async fn repeat_within_window_is_blocked() {
        let gate = gate();
        let now = Utc::now();
        gate.should_escalate("sig-1", now).await;

        let three_min_later = now + Duration::minutes(3);
        assert!(!gate.should_escalate("sig-1", three_min_later).await);
    }

    #[tokio::test]
    async fn repeat_after_window_escalates_and_grows_window() {
        let gate = gate();
        let now = Utc::now();
        gate.should_escalate("sig-1", now).await;

        let six_min_later = now + Duration::minutes(6);
        assert!(gate.should_escalate("sig-1", six_min_later).await);

        let ten_min_after_that = six_min_later + Duration::minutes(10);
        assert!(!gate.should_escalate("sig-1", ten_min_after_that).await);
    }

    #[tokio::test]
    async fn steps_cap_at_final_entry_beyond_index() {
        let gate = gate();
        let mut now = Utc::now();
        for _ in 0..10 {
            gate.should_escalate("sig-1", now).await;
            now += Duration::minutes(121);
        }
        let until = gate.cooldown_until("sig-1").await.unwrap();
        assert_eq!(until, now - Duration::minutes(121) + Duration::minutes(120));
    }

    #[tokio::test]
    async fn clear_wipes_state_allowing_immediate_reescalation() {
        let gate = gate();
        let now = Utc::now();
        gate.should_escalate("sig-1", now).await;
        gate.clear("sig-1").await;

        let moment_later = now + Duration::seconds(1);
        assert!(gate.should_escalate("sig-1", moment_later).await);
    }
}
