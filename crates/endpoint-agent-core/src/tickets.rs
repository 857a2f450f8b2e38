//! Crash-safe ticket store: an in-memory list backed by `tickets.json`,
//! written atomically with owner-only permissions on every mutating call.
//! On load, invalid records are dropped with a warning rather than
//! failing the whole file (§4.7).

use crate::types::{ResolutionCategory, Ticket, TicketResult, TicketStatus};
use chrono::{DateTime, Duration, Utc};
use endpoint_agent_common::persistence::{atomic_write_json, load_json};
use endpoint_agent_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedTickets {
    tickets: Vec<Ticket>,
    #[serde(rename = "nextId")]
    next_id: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TicketStatistics {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub resolved: usize,
    pub failed: usize,
    pub escalated: usize,
}

struct State {
    tickets: Vec<Ticket>,
    next_id: u64,
}

pub struct TicketStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl TicketStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            path: data_dir.join("tickets.json"),
            state: Mutex::new(State {
                tickets: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Load persisted tickets, validating each record's required fields;
    /// malformed entries are dropped rather than failing the whole file.
    pub async fn load(&self) {
        let raw: std::result::Result<serde_json::Value, _> = load_json(&self.path).await;
        let Ok(raw) = raw else { return };

        let next_id = raw.get("nextId").and_then(|v| v.as_u64()).unwrap_or(1);
        let mut tickets = Vec::new();
        if let Some(array) = raw.get("tickets").and_then(|v| v.as_array()) {
            for value in array {
                match serde_json::from_value::<Ticket>(value.clone()) {
                    Ok(ticket) => tickets.push(ticket),
                    Err(err) => tracing::warn!(error = %err, "dropping malformed ticket record on load"),
                }
            }
        }

        let mut state = self.state.lock().await;
        state.tickets = tickets;
        state.next_id = next_id;
    }

    async fn save(&self, state: &State) -> Result<()> {
        let persisted = PersistedTickets {
            tickets: state.tickets.clone(),
            next_id: state.next_id,
        };
        atomic_write_json(&self.path, &persisted, true).await
    }

    pub async fn create(&self, signature_id: impl Into<String>, runbook_id: Option<String>, now: DateTime<Utc>) -> Ticket {
        let mut state = self.state.lock().await;
        let ticket_id = format!("ticket-{}", state.next_id);
        state.next_id += 1;

        let ticket = Ticket {
            ticket_id,
            signature_id: signature_id.into(),
            runbook_id,
            status: TicketStatus::Open,
            steps_total: 0,
            steps_completed: 0,
            result: None,
            escalated: false,
            created_at: now,
            resolved_at: None,
            duration_ms: None,
            error: None,
            resolution_category: None,
            partial_failure: false,
        };
        state.tickets.push(ticket.clone());
        let _ = self.save(&state).await;
        ticket
    }

    pub async fn get(&self, ticket_id: &str) -> Option<Ticket> {
        let state = self.state.lock().await;
        state.tickets.iter().find(|t| t.ticket_id == ticket_id).cloned()
    }

    /// Open ticket for `signature_id`, if one exists — used by the
    /// orchestrator to skip creating a duplicate.
    pub async fn find_open_for_signature(&self, signature_id: &str) -> Option<Ticket> {
        let state = self.state.lock().await;
        state
            .tickets
            .iter()
            .find(|t| t.signature_id == signature_id && !t.status.is_terminal())
            .cloned()
    }

    pub async fn list(&self, limit: usize) -> Vec<Ticket> {
        let state = self.state.lock().await;
        let mut tickets = state.tickets.clone();
        tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tickets.truncate(limit);
        tickets
    }

    pub async fn update_status(&self, ticket_id: &str, next: TicketStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let ticket = state
            .tickets
            .iter_mut()
            .find(|t| t.ticket_id == ticket_id)
            .ok_or_else(|| Error::InputInvalid(format!("no such ticket: {ticket_id}")))?;

        if !ticket.status.can_transition_to(next) {
            return Err(Error::InputInvalid(format!(
                "illegal transition {:?} -> {:?} for {ticket_id}",
                ticket.status, next
            )));
        }
        ticket.status = next;
        self.save(&state).await
    }

    pub async fn update_progress(&self, ticket_id: &str, steps_completed: u32, steps_total: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let ticket = state
            .tickets
            .iter_mut()
            .find(|t| t.ticket_id == ticket_id)
            .ok_or_else(|| Error::InputInvalid(format!("no such ticket: {ticket_id}")))?;
        ticket.steps_completed = steps_completed;
        ticket.steps_total = steps_total;
        self.save(&state).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn close(
        &self,
        ticket_id: &str,
        result: TicketResult,
        category: ResolutionCategory,
        error: Option<String>,
        partial_failure: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let ticket = state
            .tickets
            .iter_mut()
            .find(|t| t.ticket_id == ticket_id)
            .ok_or_else(|| Error::InputInvalid(format!("no such ticket: {ticket_id}")))?;

        let next = match result {
            TicketResult::Success => TicketStatus::Resolved,
            TicketResult::Failure => TicketStatus::Failed,
        };
        if !ticket.status.can_transition_to(next) {
            return Err(Error::InputInvalid(format!("ticket {ticket_id} already in a terminal state")));
        }

        ticket.status = next;
        ticket.result = Some(result);
        ticket.resolution_category = Some(category);
        ticket.error = error;
        ticket.partial_failure = partial_failure;
        ticket.resolved_at = Some(now);
        ticket.duration_ms = Some((now - ticket.created_at).num_milliseconds().max(0) as u64);
        self.save(&state).await
    }

    pub async fn mark_escalated(&self, ticket_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let ticket = state
            .tickets
            .iter_mut()
            .find(|t| t.ticket_id == ticket_id)
            .ok_or_else(|| Error::InputInvalid(format!("no such ticket: {ticket_id}")))?;

        if !ticket.status.can_transition_to(TicketStatus::Escalated) {
            return Err(Error::InputInvalid(format!("ticket {ticket_id} cannot be escalated from its current state")));
        }
        ticket.status = TicketStatus::Escalated;
        ticket.escalated = true;
        ticket.resolution_category = Some(ResolutionCategory::Escalated);
        ticket.resolved_at = Some(now);
        self.save(&state).await
    }

    pub async fn delete_older_than(&self, days: i64, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let cutoff = now - Duration::days(days);
        let before = state.tickets.len();
        state.tickets.retain(|t| t.created_at >= cutoff);
        let removed = before - state.tickets.len();
        if removed > 0 {
            self.save(&state).await?;
        }
        Ok(removed)
    }

    pub async fn statistics(&self) -> TicketStatistics {
        let state = self.state.lock().await;
        let mut stats = TicketStatistics {
            total: state.tickets.len(),
            open: 0,
            in_progress: 0,
            resolved: 0,
            failed: 0,
            escalated: 0,
        };
        for ticket in &state.tickets {
            match ticket.status {
                TicketStatus::Open => stats.open += 1,
                TicketStatus::InProgress => stats.in_progress += 1,
                TicketStatus::Resolved => stats.resolved += 1,
                TicketStatus::Failed => stats.failed += 1,
                TicketStatus::Escalated => stats.escalated += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let now = Utc::now();

        let ticket = store.create("sig-1", None, now).await;
        let fetched = store.get(&ticket.ticket_id).await.unwrap();
        assert_eq!(fetched.signature_id, "sig-1");
        assert_eq!(fetched.status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn cannot_transition_out_of_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let now = Utc::now();

        let ticket = store.create("sig-1", None, now).await;
        store
            .close(&ticket.ticket_id, TicketResult::Success, ResolutionCategory::Fixed, None, false, now)
            .await
            .unwrap();

        let result = store.update_status(&ticket.ticket_id, TicketStatus::InProgress).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_computes_duration_and_sets_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let now = Utc::now();

        let ticket = store.create("sig-1", None, now).await;
        let later = now + Duration::seconds(5);
        store
            .close(
                &ticket.ticket_id,
                TicketResult::Failure,
                ResolutionCategory::Protected,
                Some("protected".into()),
                false,
                later,
            )
            .await
            .unwrap();

        let fetched = store.get(&ticket.ticket_id).await.unwrap();
        assert_eq!(fetched.status, TicketStatus::Failed);
        assert_eq!(fetched.duration_ms, Some(5000));
        assert_eq!(fetched.resolution_category, Some(ResolutionCategory::Protected));
    }

    #[tokio::test]
    async fn load_drops_malformed_records_but_keeps_valid_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickets.json");
        let raw = serde_json::json!({
            "tickets": [
                {"not": "a ticket"},
                {
                    "ticket_id": "ticket-1",
                    "signature_id": "sig-1",
                    "runbook_id": null,
                    "status": "open",
                    "steps_total": 0,
                    "steps_completed": 0,
                    "result": null,
                    "escalated": false,
                    "created_at": Utc::now().to_rfc3339(),
                    "resolved_at": null,
                    "duration_ms": null,
                    "error": null,
                    "resolution_category": null
                }
            ],
            "nextId": 2
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&raw).unwrap()).await.unwrap();

        let store = TicketStore::new(dir.path().to_path_buf());
        store.load().await;

        let tickets = store.list(10).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].ticket_id, "ticket-1");
    }

    #[tokio::test]
    async fn delete_older_than_prunes_old_tickets() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::new(dir.path().to_path_buf());
        let old = Utc::now() - Duration::days(100);
        store.create("sig-old", None, old).await;
        store.create("sig-new", None, Utc::now()).await;

        let removed = store.delete_older_than(90, Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list(10).await.len(), 1);
    }
}
