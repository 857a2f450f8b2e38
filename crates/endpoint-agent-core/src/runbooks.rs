//! Hash-verified runbook registry. On load, the file's SHA-256 is compared
//! against a sidecar registry entry: first sight registers the hash,
//! a match accepts the file, a mismatch quarantines it and falls back to
//! built-in defaults (§4.8).

use crate::types::{Runbook, RunbookStep, SignalCategory};
use endpoint_agent_common::persistence::{atomic_write_json, load_json};
use endpoint_agent_common::{Error, Result};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunbookFile {
    runbooks: Vec<Runbook>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HashRegistry {
    hashes: HashMap<String, String>,
}

fn builtin_defaults() -> Vec<Runbook> {
    vec![
        Runbook {
            id: "rb-service-stopped".to_string(),
            category: SignalCategory::Services,
            timeout_ms: 30_000,
            requires_approval: false,
            steps: vec![RunbookStep {
                primitive: "restartService".to_string(),
                params: HashMap::from([("service_name".to_string(), "{{target_service}}".to_string())]),
                output_key: "restart_result".to_string(),
                critical: true,
            }],
        },
        Runbook {
            id: "rb-process-runaway".to_string(),
            category: SignalCategory::Performance,
            timeout_ms: 15_000,
            requires_approval: false,
            steps: vec![RunbookStep {
                primitive: "killProcess".to_string(),
                params: HashMap::from([("process_name".to_string(), "{{target_process}}".to_string())]),
                output_key: "kill_result".to_string(),
                critical: true,
            }],
        },
        Runbook {
            id: "rb-disk-cleanup".to_string(),
            category: SignalCategory::Storage,
            timeout_ms: 60_000,
            requires_approval: true,
            steps: vec![RunbookStep {
                primitive: "cleanTempFiles".to_string(),
                params: HashMap::from([("drive".to_string(), "{{target_drive}}".to_string())]),
                output_key: "cleanup_result".to_string(),
                critical: false,
            }],
        },
        Runbook {
            id: "rb-network-reset".to_string(),
            category: SignalCategory::Network,
            timeout_ms: 30_000,
            requires_approval: true,
            steps: vec![RunbookStep {
                primitive: "flushDNS".to_string(),
                params: HashMap::new(),
                output_key: "flush_result".to_string(),
                critical: false,
            }],
        },
        Runbook {
            id: "rb-process-investigate".to_string(),
            category: SignalCategory::Processes,
            timeout_ms: 15_000,
            requires_approval: true,
            steps: vec![RunbookStep {
                primitive: "fileOp".to_string(),
                params: HashMap::new(),
                output_key: "investigate_result".to_string(),
                critical: false,
            }],
        },
        Runbook {
            id: "rb-eventlog-triage".to_string(),
            category: SignalCategory::Eventlog,
            timeout_ms: 15_000,
            requires_approval: true,
            steps: vec![RunbookStep {
                primitive: "fileOp".to_string(),
                params: HashMap::new(),
                output_key: "triage_result".to_string(),
                critical: false,
            }],
        },
    ]
}

fn validate(runbook: &Runbook) -> Result<()> {
    if runbook.id.is_empty() {
        return Err(Error::InputInvalid("runbook missing id".to_string()));
    }
    if runbook.steps.is_empty() {
        return Err(Error::InputInvalid(format!("runbook {} has no steps", runbook.id)));
    }
    for step in &runbook.steps {
        if step.primitive.is_empty() || step.output_key.is_empty() {
            return Err(Error::InputInvalid(format!(
                "runbook {} has a step missing primitive/output_key",
                runbook.id
            )));
        }
    }
    Ok(())
}

pub struct RunbookRegistry {
    data_dir: PathBuf,
    runbooks: RwLock<HashMap<String, Runbook>>,
}

impl RunbookRegistry {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            runbooks: RwLock::new(HashMap::new()),
        }
    }

    fn runbooks_path(&self) -> PathBuf {
        self.data_dir.join("runbooks.json")
    }

    fn registry_path(&self) -> PathBuf {
        self.data_dir.join("runbooks.hashes.json")
    }

    fn quarantine_path(&self) -> PathBuf {
        self.data_dir.join("runbooks.json.quarantined")
    }

    /// Load and verify `runbooks.json`, falling back to built-in defaults
    /// for any category not covered (or if the file is absent/rejected).
    pub async fn load(&self) {
        let mut by_category: HashMap<SignalCategory, Runbook> = HashMap::new();
        for rb in builtin_defaults() {
            by_category.insert(rb.category, rb);
        }

        if let Ok(bytes) = tokio::fs::read(&self.runbooks_path()).await {
            let file_hash = hex::encode(digest(&SHA256, &bytes).as_ref());
            let mut registry: HashRegistry = load_json(&self.registry_path()).await.unwrap_or_default();

            let accept = match registry.hashes.get("runbooks.json") {
                Some(stored) if *stored == file_hash => true,
                Some(_) => {
                    tracing::warn!("runbooks.json hash mismatch; quarantining and using built-in defaults");
                    let _ = tokio::fs::rename(&self.runbooks_path(), &self.quarantine_path()).await;
                    false
                }
                None => {
                    registry.hashes.insert("runbooks.json".to_string(), file_hash);
                    let _ = atomic_write_json(&self.registry_path(), &registry, false).await;
                    true
                }
            };

            if accept {
                if let Ok(parsed) = serde_json::from_slice::<RunbookFile>(&bytes) {
                    for rb in parsed.runbooks {
                        if validate(&rb).is_ok() {
                            by_category.insert(rb.category, rb);
                        } else {
                            tracing::warn!(id = %rb.id, "dropping invalid runbook");
                        }
                    }
                }
            }
        }

        let keyed: HashMap<String, Runbook> = by_category.into_values().map(|rb| (rb.id.clone(), rb)).collect();
        *self.runbooks.write().await = keyed;
    }

    pub async fn lookup(&self, category: SignalCategory) -> Option<Runbook> {
        let runbooks = self.runbooks.read().await;
        runbooks.values().find(|rb| rb.category == category).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<Runbook> {
        self.runbooks.read().await.get(id).cloned()
    }

    /// Validate and atomically swap in a server-pushed runbook set; picked
    /// up by the next orchestrator cycle automatically since lookups read
    /// through the shared map.
    pub async fn replace(&self, file_contents: &str) -> Result<()> {
        let parsed: RunbookFile = serde_json::from_str(file_contents).map_err(Error::Serialization)?;
        for rb in &parsed.runbooks {
            validate(rb)?;
        }

        let mut by_category: HashMap<SignalCategory, Runbook> = HashMap::new();
        for rb in builtin_defaults() {
            by_category.insert(rb.category, rb);
        }
        for rb in parsed.runbooks {
            by_category.insert(rb.category, rb);
        }

        let bytes = file_contents.as_bytes();
        let hash = hex::encode(digest(&SHA256, bytes).as_ref());
        let mut registry: HashRegistry = load_json(&self.registry_path()).await.unwrap_or_default();
        registry.hashes.insert("runbooks.json".to_string(), hash);
        atomic_write_json(&self.registry_path(), &registry, false).await?;
        atomic_write_json(&self.runbooks_path(), &serde_json::from_str::<serde_json::Value>(file_contents)?, false)
            .await?;

        let keyed: HashMap<String, Runbook> = by_category.into_values().map(|rb| (rb.id.clone(), rb)).collect();
        *self.runbooks.write().await = keyed;
        Ok(())
    }
}
