//! Single logical monitoring loop tying every component together: collect,
//! profile, evaluate rules, correlate, track patterns/health, and either
//! auto-remediate or escalate (§4.11).

use crate::correlator::Correlator;
use crate::cooldown::CooldownGate;
use crate::eventlog;
use crate::executor::Executor;
use crate::metric_store::MetricStore;
use crate::pattern::PatternHealthTracker;
use crate::ports::{ControlMessage, EventLogSource, MetricCollector, OutboundMessage, Transport};
use crate::profiler::Profiler;
use crate::protected::is_protected_process;
use crate::rules::RuleEngine;
use crate::runbooks::RunbookRegistry;
use crate::signature::{self, target_for_drive, target_for_process, target_for_service};
use crate::tickets::TicketStore;
use crate::types::{DeviceContext, DeviceSignature, Exclusions, Severity, Signal, SignalMetadata, Target, TargetType, TicketStatus};
use chrono::{DateTime, Utc};
use endpoint_agent_common::config::Config;
use endpoint_agent_common::persistence::{atomic_write_json, load_json};
use endpoint_agent_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

pub struct Orchestrator {
    config: Config,
    context: DeviceContext,
    metric_store: MetricStore,
    profiler: Profiler,
    rules: RuleEngine,
    correlator: Correlator,
    pattern_health: Mutex<PatternHealthTracker>,
    tickets: TicketStore,
    runbooks: RunbookRegistry,
    cooldown: CooldownGate,
    executor: Executor,
    exclusions: RwLock<Exclusions>,
}

impl Orchestrator {
    pub fn new(config: Config, primitives: Arc<dyn crate::ports::PrimitiveExecutor>) -> Self {
        let data_dir = config.agent.data_dir.clone();
        let context = DeviceContext {
            os_build: config.agent.os_build.clone(),
            os_version: config.agent.os_version.clone(),
            device_role: config.agent.device_role.clone(),
        };
        Self {
            profiler: Profiler::new(data_dir.clone(), config.profiler.top_process_count),
            rules: RuleEngine::new(config.rules.clone()),
            correlator: Correlator::new(config.correlator.clone()),
            pattern_health: Mutex::new(PatternHealthTracker::new(data_dir.clone())),
            tickets: TicketStore::new(data_dir.clone()),
            runbooks: RunbookRegistry::new(data_dir.clone()),
            cooldown: CooldownGate::new(config.cooldown.clone()),
            executor: Executor::new(primitives, config.executor.clone()),
            exclusions: RwLock::new(Exclusions::default()),
            metric_store: MetricStore::new(),
            context,
            config,
        }
    }

    fn exclusions_path(&self) -> std::path::PathBuf {
        self.config.agent.data_dir.join("exclusions.json")
    }

    /// Load all persisted component state; called once at startup.
    pub async fn load(&self) {
        self.profiler.load().await;
        self.runbooks.load().await;
        self.tickets.load().await;
        self.pattern_health.lock().await.load().await;
        if let Ok(exclusions) = load_json::<Exclusions>(&self.exclusions_path()).await {
            *self.exclusions.write().await = exclusions;
        }
    }

    /// Flush every component with on-disk state; called periodically and on
    /// graceful shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.profiler.flush().await?;
        self.pattern_health.lock().await.flush().await?;
        Ok(())
    }

    fn metric_prefix_for_health(signal: &Signal) -> String {
        signal.metric.strip_prefix("eventlog:").unwrap_or(&signal.metric).to_string()
    }

    fn targets_for(signal: &Signal) -> Vec<Target> {
        match &signal.metadata {
            SignalMetadata::Service { service_name } => vec![target_for_service(service_name.clone())],
            SignalMetadata::Process { process_name, .. } if !process_name.is_empty() => {
                vec![target_for_process(process_name.clone())]
            }
            SignalMetadata::Process { .. } => vec![],
            SignalMetadata::Disk { drive } => vec![target_for_drive(drive.clone())],
            SignalMetadata::System => vec![],
            SignalMetadata::Network { interface: Some(name) } => vec![Target {
                target_type: TargetType::Network,
                name: name.clone(),
            }],
            SignalMetadata::Network { interface: None } => vec![],
            SignalMetadata::EventLog { .. } => vec![],
        }
    }

    /// Highest-CPU process in the snapshot, excluding protected processes —
    /// the target the CPU-critical rule attaches to its signal.
    fn top_cpu_process(snapshot: &crate::metric_store::Snapshot) -> Option<String> {
        snapshot
            .iter()
            .filter_map(|(key, entry)| {
                let name = key.strip_prefix("process:")?.strip_suffix(":cpu")?;
                if is_protected_process(name) {
                    None
                } else {
                    Some((name.to_string(), entry.sample.value))
                }
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name)
    }

    /// Run one collector tick: gather samples, evaluate signals, and drive
    /// each one through signature/correlation/pattern/health tracking and
    /// either auto-remediation or escalation.
    pub async fn tick(
        &self,
        collectors: &[Arc<dyn MetricCollector>],
        event_log: &dyn EventLogSource,
        transport: Option<&dyn Transport>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for collector in collectors {
            if let Ok(samples) = collector.collect().await {
                self.metric_store.put_all(samples).await;
            }
        }

        let snapshot = self.metric_store.snapshot().await;
        for (key, entry) in snapshot.iter() {
            self.profiler.record(key, entry.sample.value, entry.sample.captured_at).await;
            if let Some(name) = key.strip_prefix("process:").and_then(|s| s.strip_suffix(":cpu")) {
                self.profiler.observe_process(name).await;
            }
        }

        let exclusions = self.exclusions.read().await.clone();
        let top_cpu = Self::top_cpu_process(&snapshot);
        let mut signals = self
            .rules
            .evaluate(&snapshot, &self.profiler, &exclusions, top_cpu.as_deref(), now)
            .await;
        if let Ok(records) = event_log.drain().await {
            signals.extend(eventlog::to_signals(records));
        }

        let firings = self.correlator.ingest(signals.clone(), &snapshot, now).await;
        {
            let mut tracker = self.pattern_health.lock().await;
            for firing in firings {
                if let Some(transport) = transport {
                    let _ = transport
                        .send(OutboundMessage::CorrelationFired {
                            rule_id: firing.rule_id.clone(),
                            confidence: firing.confidence,
                            description: firing.description.clone(),
                        })
                        .await;
                }
                tracker.record_correlation(firing);
            }
        }

        for signal in &signals {
            if exclusions.excludes_signature(&signal.id) {
                continue;
            }
            self.handle_signal(signal, transport, now).await?;
        }

        Ok(())
    }

    async fn handle_signal(&self, signal: &Signal, transport: Option<&dyn Transport>, now: DateTime<Utc>) -> Result<()> {
        let targets = Self::targets_for(signal);
        let device_signature = signature::generate(signal, targets, self.context.clone());

        {
            let mut tracker = self.pattern_health.lock().await;
            if let Some(action) = tracker.record_signal(signal, now) {
                if let Some(transport) = transport {
                    let _ = transport
                        .send(OutboundMessage::ProactiveActionCreated {
                            action_id: action.action_id.clone(),
                            title: action.title.clone(),
                        })
                        .await;
                }
            }

            let component = PatternHealthTracker::component_for(&device_signature);
            tracker.update_health(&component, &Self::metric_prefix_for_health(signal), signal.severity, now);
            if let Some(score) = tracker.health_score(&component) {
                if let Some(transport) = transport {
                    let _ = transport
                        .send(OutboundMessage::HealthScoreUpdate {
                            component: component.clone(),
                            score: score.score,
                        })
                        .await;
                }
            }
        }

        if self.tickets.find_open_for_signature(&device_signature.signature_id).await.is_some() {
            return Ok(());
        }

        let runbook = self.runbooks.lookup(device_signature.category).await;
        match &runbook {
            Some(rb) if !rb.requires_approval => {
                let ticket = self
                    .tickets
                    .create(device_signature.signature_id.clone(), Some(rb.id.clone()), now)
                    .await;
                self.executor.run(&self.tickets, &ticket, rb, &device_signature, now).await?;
                if let Some(transport) = transport {
                    if let Some(ticket) = self.tickets.get(&ticket.ticket_id).await {
                        let _ = transport.send(OutboundMessage::TicketUpdate { ticket }).await;
                    }
                }
            }
            _ => {
                if self.cooldown.should_escalate(&device_signature.signature_id, now).await {
                    let ticket = self
                        .tickets
                        .create(device_signature.signature_id.clone(), runbook.as_ref().map(|r| r.id.clone()), now)
                        .await;
                    self.tickets.mark_escalated(&ticket.ticket_id, now).await?;

                    let diagnostic_data = if let Some(rb) = &runbook {
                        let timeout = Duration::from_millis(self.config.transport.diagnostic_timeout_ms);
                        Some(self.executor.diagnose(rb, &device_signature, timeout).await)
                    } else {
                        None
                    };

                    if let Some(transport) = transport {
                        if let Some(ticket) = self.tickets.get(&ticket.ticket_id).await {
                            let _ = transport
                                .send(OutboundMessage::Escalation {
                                    signature: device_signature,
                                    ticket,
                                    diagnostic_data,
                                })
                                .await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Build a `metric-report` message from the current snapshot, the
    /// profiler's top processes, and every tracked component's health score
    /// — the periodic dashboard push transport sends on its own cadence,
    /// independent of the per-signal messages a tick emits.
    pub async fn metric_report(&self) -> OutboundMessage {
        let snapshot = self.metric_store.snapshot().await;
        let snapshot_json = serde_json::json!(snapshot
            .iter()
            .map(|(key, entry)| (key.clone(), entry.sample.value))
            .collect::<std::collections::HashMap<_, _>>());

        let top_processes = self.profiler.top_processes().await;
        let health_scores: std::collections::HashMap<String, i32> = {
            let tracker = self.pattern_health.lock().await;
            top_processes
                .iter()
                .chain(std::iter::once(&"system".to_string()))
                .filter_map(|component| tracker.health_score(component).map(|score| (component.clone(), score.score)))
                .collect()
        };

        OutboundMessage::MetricReport {
            snapshot: snapshot_json,
            dashboard_summary: serde_json::json!({
                "top_processes": top_processes,
                "health_scores": health_scores,
            }),
        }
    }

    /// Apply a server-pushed control message: hot-swap runbooks or
    /// exclusions, clear a signature's cooldown, or approve a
    /// pending-approval ticket for execution.
    pub async fn apply_control(&self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::UpdateRunbooks { runbooks_json } => self.runbooks.replace(&runbooks_json).await,
            ControlMessage::UpdateExclusions { exclusions_json } => {
                let exclusions: Exclusions = serde_json::from_str(&exclusions_json)?;
                atomic_write_json(&self.exclusions_path(), &exclusions, false).await?;
                *self.exclusions.write().await = exclusions;
                Ok(())
            }
            ControlMessage::AcknowledgeSignature { signature_id } => {
                self.cooldown.clear(&signature_id).await;
                Ok(())
            }
            ControlMessage::ApproveTicket { ticket_id } => self.approve_ticket(&ticket_id, Utc::now()).await,
        }
    }

    /// Run the ticket's stored runbook now that an operator approved it.
    /// The original signature's targets aren't retained past ticket
    /// creation, so this reconstructs a minimal signature from the ticket
    /// alone; step placeholders fall back to their documented defaults.
    async fn approve_ticket(&self, ticket_id: &str, now: DateTime<Utc>) -> Result<()> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await
            .ok_or_else(|| endpoint_agent_common::Error::InputInvalid(format!("no such ticket: {ticket_id}")))?;
        let Some(runbook_id) = &ticket.runbook_id else {
            return Err(endpoint_agent_common::Error::InputInvalid(format!("ticket {ticket_id} has no runbook")));
        };
        let runbook = self
            .runbooks
            .get(runbook_id)
            .await
            .ok_or_else(|| endpoint_agent_common::Error::InputInvalid(format!("unknown runbook: {runbook_id}")))?;

        if !ticket.status.can_transition_to(TicketStatus::InProgress) {
            return Err(endpoint_agent_common::Error::InputInvalid(format!(
                "ticket {ticket_id} cannot be approved from its current state"
            )));
        }

        let signature = DeviceSignature {
            signature_id: ticket.signature_id.clone(),
            symptoms: vec![],
            targets: vec![],
            context: self.context.clone(),
            severity: Severity::Warning,
            confidence_local: 50,
            category: runbook.category,
        };
        self.executor.run(&self.tickets, &ticket, &runbook, &signature, now).await
    }
}
