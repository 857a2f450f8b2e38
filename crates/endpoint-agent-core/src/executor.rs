//! Remediation executor: runs a runbook's steps against a ticket, resolving
//! `{{placeholders}}` from the signature's targets and stopping on the
//! first fatal step (§4.10).

use crate::ports::{PrimitiveExecutor, PrimitiveParams};
use crate::tickets::TicketStore;
use crate::types::{DeviceSignature, ResolutionCategory, Runbook, TargetType, Ticket, TicketResult, TicketStatus};
use chrono::{DateTime, Utc};
use endpoint_agent_common::config::ExecutorConfig;
use endpoint_agent_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct Executor {
    primitives: Arc<dyn PrimitiveExecutor>,
    config: ExecutorConfig,
}

fn is_fatal(error: &str) -> bool {
    let lower = error.to_ascii_lowercase();
    lower.contains("protected") || lower.contains("invalid")
}

fn resolve_params(step_params: &HashMap<String, String>, signature: &DeviceSignature) -> PrimitiveParams {
    let target_service = signature
        .targets
        .iter()
        .find(|t| t.target_type == TargetType::Service)
        .map(|t| t.name.clone());
    let target_process = signature
        .targets
        .iter()
        .find(|t| t.target_type == TargetType::Process)
        .map(|t| t.name.clone());
    let target_drive = signature
        .targets
        .iter()
        .find(|t| t.target_type == TargetType::System)
        .map(|t| t.name.clone());

    let mut values = HashMap::new();
    for (key, value) in step_params {
        let resolved = match value.as_str() {
            "{{target_service}}" => target_service.clone().unwrap_or_else(|| "unknown-service".to_string()),
            "{{target_process}}" => target_process.clone().unwrap_or_else(|| "unknown-process".to_string()),
            "{{target_drive}}" => target_drive.clone().unwrap_or_else(|| "C".to_string()),
            other => other.to_string(),
        };
        values.insert(key.clone(), resolved);
    }
    PrimitiveParams { values }
}

impl Executor {
    pub fn new(primitives: Arc<dyn PrimitiveExecutor>, config: ExecutorConfig) -> Self {
        Self { primitives, config }
    }

    /// Run every step of `runbook` against `ticket`, updating its progress
    /// and closing it once the run finishes (successfully, on the first
    /// fatal step, or because the runbook-level timeout ran out with steps
    /// still left to go).
    pub async fn run(
        &self,
        tickets: &TicketStore,
        ticket: &Ticket,
        runbook: &Runbook,
        signature: &DeviceSignature,
        now: DateTime<Utc>,
    ) -> Result<()> {
        tickets.update_status(&ticket.ticket_id, TicketStatus::InProgress).await?;

        let total = runbook.steps.len() as u32;
        let mut completed = 0u32;
        let mut fatal_error: Option<String> = None;
        let mut partial_failure = false;
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(runbook.timeout_ms.min(self.config.runbook_timeout_ms));

        for step in &runbook.steps {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                partial_failure = true;
                fatal_error = Some("runbook timeout exceeded, remaining steps skipped".to_string());
                break;
            }

            let params = resolve_params(&step.params, signature);
            let call = self.primitives.execute(&step.primitive, &params);

            let outcome = match tokio::time::timeout(remaining.min(step_timeout), call).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    fatal_error = Some(err.to_string());
                    break;
                }
                Err(_) => {
                    if step.critical {
                        fatal_error = Some(format!("{} timed out", step.primitive));
                        break;
                    }
                    completed += 1;
                    tickets.update_progress(&ticket.ticket_id, completed, total).await?;
                    continue;
                }
            };

            if !outcome.success {
                let error = outcome.error.unwrap_or_default();
                if is_fatal(&error) || step.critical {
                    fatal_error = Some(error);
                    break;
                }
            }

            completed += 1;
            tickets.update_progress(&ticket.ticket_id, completed, total).await?;
        }

        let (result, category) = match &fatal_error {
            Some(error) if error.to_ascii_lowercase().contains("protected") => {
                (TicketResult::Failure, ResolutionCategory::Protected)
            }
            Some(_) => (TicketResult::Failure, ResolutionCategory::Ignored),
            None => (TicketResult::Success, ResolutionCategory::Fixed),
        };

        tickets
            .close(&ticket.ticket_id, result, category, fatal_error, partial_failure, now)
            .await?;

        tokio::time::sleep(Duration::from_millis(self.config.auto_close_delay_ms)).await;
        Ok(())
    }

    /// Best-effort diagnostic pass ahead of an escalation: runs `runbook`'s
    /// steps within an overall bounded timeout and returns whatever output
    /// it collected before time ran out. Never touches a ticket.
    pub async fn diagnose(
        &self,
        runbook: &Runbook,
        signature: &DeviceSignature,
        overall_timeout: Duration,
    ) -> serde_json::Value {
        let deadline = tokio::time::Instant::now() + overall_timeout;
        let mut results = serde_json::Map::new();

        for step in &runbook.steps {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let params = resolve_params(&step.params, signature);
            match tokio::time::timeout(remaining, self.primitives.execute(&step.primitive, &params)).await {
                Ok(Ok(outcome)) => {
                    results.insert(
                        step.output_key.clone(),
                        serde_json::json!({
                            "success": outcome.success,
                            "output": outcome.output,
                            "error": outcome.error,
                        }),
                    );
                }
                Ok(Err(err)) => {
                    results.insert(step.output_key.clone(), serde_json::json!({"success": false, "error": err.to_string()}));
                }
                Err(_) => {
                    results.insert(
                        step.output_key.clone(),
                        serde_json::json!({"success": false, "error": "diagnostic timed out"}),
                    );
                    break;
                }
            }
        }

        serde_json::Value::Object(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{target_for_process, target_for_service};
    use crate::stubs::StubPrimitiveExecutor;
    use crate::types::{DeviceContext, Severity, SignalCategory};
    use async_trait::async_trait;

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            step_timeout_ms: 1_000,
            runbook_timeout_ms: 5_000,
            auto_close_delay_ms: 0,
        }
    }

    fn context() -> DeviceContext {
        DeviceContext {
            os_build: "22631".to_string(),
            os_version: "10.0".to_string(),
            device_role: "workstation".to_string(),
        }
    }

    fn signature(targets: Vec<crate::types::Target>) -> DeviceSignature {
        DeviceSignature {
            signature_id: "sig-1".to_string(),
            symptoms: vec![],
            targets,
            context: context(),
            severity: Severity::Critical,
            confidence_local: 90,
            category: SignalCategory::Services,
        }
    }

    fn restart_service_runbook() -> Runbook {
        Runbook {
            id: "rb-service-stopped".to_string(),
            category: SignalCategory::Services,
            timeout_ms: 5_000,
            requires_approval: false,
            steps: vec![crate::types::RunbookStep {
                primitive: "restartService".to_string(),
                params: HashMap::from([("service_name".to_string(), "{{target_service}}".to_string())]),
                output_key: "restart_result".to_string(),
                critical: true,
            }],
        }
    }

    #[tokio::test]
    async fn successful_run_resolves_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        let ticket = store.create("sig-1", Some("rb-service-stopped".to_string()), now).await;

        let executor = Executor::new(Arc::new(StubPrimitiveExecutor::default()), config());
        let sig = signature(vec![target_for_service("Spooler")]);
        executor.run(&store, &ticket, &restart_service_runbook(), &sig, now).await.unwrap();

        let fetched = store.get(&ticket.ticket_id).await.unwrap();
        assert_eq!(fetched.status, TicketStatus::Resolved);
        assert_eq!(fetched.steps_completed, 1);
    }

    #[tokio::test]
    async fn protected_service_fails_ticket_with_protected_category() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        let ticket = store.create("sig-1", Some("rb-service-stopped".to_string()), now).await;

        let executor = Executor::new(Arc::new(StubPrimitiveExecutor::default()), config());
        let sig = signature(vec![target_for_service("RpcSs")]);
        executor.run(&store, &ticket, &restart_service_runbook(), &sig, now).await.unwrap();

        let fetched = store.get(&ticket.ticket_id).await.unwrap();
        assert_eq!(fetched.status, TicketStatus::Failed);
        assert_eq!(fetched.resolution_category, Some(ResolutionCategory::Protected));
    }

    struct AlwaysFatal;

    #[async_trait]
    impl PrimitiveExecutor for AlwaysFatal {
        async fn execute(&self, _op: &str, _params: &PrimitiveParams) -> Result<crate::ports::PrimitiveOutcome> {
            Ok(crate::ports::PrimitiveOutcome {
                success: false,
                output: None,
                error: Some("invalid input".to_string()),
                duration_ms: 0,
            })
        }
    }

    #[tokio::test]
    async fn non_critical_step_after_fatal_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        let ticket = store.create("sig-1", None, now).await;

        let runbook = Runbook {
            id: "rb-two-step".to_string(),
            category: SignalCategory::Services,
            timeout_ms: 5_000,
            requires_approval: false,
            steps: vec![
                crate::types::RunbookStep {
                    primitive: "restartService".to_string(),
                    params: HashMap::new(),
                    output_key: "a".to_string(),
                    critical: true,
                },
                crate::types::RunbookStep {
                    primitive: "flushDNS".to_string(),
                    params: HashMap::new(),
                    output_key: "b".to_string(),
                    critical: false,
                },
            ],
        };

        let executor = Executor::new(Arc::new(AlwaysFatal), config());
        let sig = signature(vec![target_for_process("chrome.exe")]);
        executor.run(&store, &ticket, &runbook, &sig, now).await.unwrap();

        let fetched = store.get(&ticket.ticket_id).await.unwrap();
        assert_eq!(fetched.status, TicketStatus::Failed);
        assert_eq!(fetched.steps_completed, 0);
    }

    struct SlowExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl PrimitiveExecutor for SlowExecutor {
        async fn execute(&self, _op: &str, _params: &PrimitiveParams) -> Result<crate::ports::PrimitiveOutcome> {
            tokio::time::sleep(self.delay).await;
            Ok(crate::ports::PrimitiveOutcome {
                success: true,
                output: None,
                error: None,
                duration_ms: self.delay.as_millis() as u64,
            })
        }
    }

    #[tokio::test]
    async fn runbook_timeout_caps_total_step_time_and_marks_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        let ticket = store.create("sig-1", None, now).await;

        let step = crate::types::RunbookStep {
            primitive: "fileOp".to_string(),
            params: HashMap::new(),
            output_key: "a".to_string(),
            critical: false,
        };
        let runbook = Runbook {
            id: "rb-slow".to_string(),
            category: SignalCategory::Services,
            timeout_ms: 120,
            requires_approval: false,
            steps: vec![step.clone(), step.clone(), step],
        };

        let executor = Executor::new(
            Arc::new(SlowExecutor { delay: Duration::from_millis(80) }),
            ExecutorConfig {
                step_timeout_ms: 1_000,
                runbook_timeout_ms: 5_000,
                auto_close_delay_ms: 0,
            },
        );
        let sig = signature(vec![]);
        executor.run(&store, &ticket, &runbook, &sig, now).await.unwrap();

        let fetched = store.get(&ticket.ticket_id).await.unwrap();
        assert!(fetched.partial_failure, "remaining steps should be skipped once the runbook deadline passes");
        assert!(fetched.steps_completed < 3, "not every 80ms step should fit inside a 120ms runbook budget");
        assert_eq!(fetched.status, TicketStatus::Failed);
    }

    #[tokio::test]
    async fn diagnose_collects_output_without_touching_a_ticket() {
        let executor = Executor::new(Arc::new(StubPrimitiveExecutor::default()), config());
        let sig = signature(vec![target_for_service("Spooler")]);
        let result = executor.diagnose(&restart_service_runbook(), &sig, Duration::from_secs(1)).await;
        assert_eq!(result["restart_result"]["success"], serde_json::json!(true));
    }
}
