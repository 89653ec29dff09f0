//! Built-in in-memory database.
//!
//! Reference implementation of the [`Database`] traits used by the test
//! suites and by deployments without a SQL server. A transaction holds
//! the state lock for its whole lifetime and keeps an undo copy, so a
//! rollback (or a drop without commit) restores the pre-transaction
//! state exactly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Database, DbTransaction, HistoryRow, NotifiedState, RuntimeTables};
use crate::core::{ContactRole, DbError, Event, EventId, HistoryId, IncidentId, ObjectId, RuleId};
use crate::incident::Incident;
use crate::object::Object;
use crate::recipient::RecipientKey;

#[derive(Default, Clone)]
struct MemoryState {
    next_event_id: EventId,
    next_incident_id: IncidentId,
    next_history_id: HistoryId,

    objects: HashMap<ObjectId, Object>,
    events: Vec<Event>,
    incidents: HashMap<IncidentId, Incident>,
    history: Vec<HistoryRow>,
    incident_rules: Vec<(IncidentId, RuleId)>,
    incident_contacts: HashMap<(IncidentId, RecipientKey), ContactRole>,
    escalation_states: HashMap<(IncidentId, i64), DateTime<Utc>>,

    runtime: RuntimeTables,
}

#[derive(Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the runtime-configuration tables the next
    /// `load_runtime_tables` call will return.
    pub async fn seed_runtime(&self, tables: RuntimeTables) {
        self.state.lock().await.runtime = tables;
    }

    /// All persisted events, in insertion order.
    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    /// History rows of one incident, in insertion order.
    pub async fn history(&self, incident_id: IncidentId) -> Vec<HistoryRow> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|row| row.incident_id == incident_id)
            .cloned()
            .collect()
    }

    /// Latest persisted snapshot of one incident.
    pub async fn incident(&self, id: IncidentId) -> Option<Incident> {
        self.state.lock().await.incidents.get(&id).cloned()
    }

    /// All persisted incidents, open and closed.
    pub async fn incidents(&self) -> Vec<Incident> {
        self.state.lock().await.incidents.values().cloned().collect()
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    undo: Option<MemoryState>,
}

impl MemoryTransaction {
    fn state(&mut self) -> Result<&mut MemoryState, DbError> {
        if self.undo.is_none() {
            return Err(DbError::TransactionClosed);
        }
        Ok(&mut self.guard)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // A transaction dropped without commit rolls back.
        if let Some(undo) = self.undo.take() {
            *self.guard = undo;
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DbError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let undo = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            undo: Some(undo),
        }))
    }

    async fn load_runtime_tables(&self) -> Result<RuntimeTables, DbError> {
        Ok(self.state.lock().await.runtime.clone())
    }

    async fn restore_muted_objects(&self) -> Result<Vec<Object>, DbError> {
        let state = self.state.lock().await;
        let open: Vec<ObjectId> = state
            .incidents
            .values()
            .filter(|i| i.recovered_at.is_none())
            .map(|i| i.object_id)
            .collect();
        Ok(state
            .objects
            .values()
            .filter(|o| o.is_muted() && !open.contains(&o.id))
            .cloned()
            .collect())
    }

    async fn load_open_incidents(&self) -> Result<Vec<(Incident, Object)>, DbError> {
        let state = self.state.lock().await;
        let mut result = Vec::new();
        for incident in state.incidents.values() {
            if incident.recovered_at.is_some() {
                continue;
            }
            let Some(obj) = state.objects.get(&incident.object_id) else {
                return Err(DbError::NotFound(format!(
                    "object {} of open incident {}",
                    incident.object_id, incident.id
                )));
            };
            result.push((incident.clone(), obj.clone()));
        }
        Ok(result)
    }

    async fn update_notified(
        &self,
        history_id: HistoryId,
        state: NotifiedState,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let mut db = self.state.lock().await;
        let row = db
            .history
            .iter_mut()
            .find(|row| row.id == history_id)
            .ok_or_else(|| DbError::NotFound(format!("history row {history_id}")))?;
        row.notified_state = Some(state);
        row.sent_at = sent_at;
        Ok(())
    }
}

#[async_trait]
impl DbTransaction for MemoryTransaction {
    async fn upsert_object(&mut self, obj: &Object) -> Result<(), DbError> {
        self.state()?.objects.insert(obj.id, obj.clone());
        Ok(())
    }

    async fn insert_event(&mut self, ev: &Event) -> Result<EventId, DbError> {
        let state = self.state()?;
        state.next_event_id += 1;
        let id = state.next_event_id;
        let mut stored = ev.clone();
        stored.id = Some(id);
        state.events.push(stored);
        Ok(id)
    }

    async fn insert_incident(&mut self, incident: &Incident) -> Result<IncidentId, DbError> {
        let state = self.state()?;
        state.next_incident_id += 1;
        let id = state.next_incident_id;
        let mut stored = incident.clone();
        stored.id = id;
        state.incidents.insert(id, stored);
        Ok(id)
    }

    async fn update_incident(&mut self, incident: &Incident) -> Result<(), DbError> {
        let state = self.state()?;
        if !state.incidents.contains_key(&incident.id) {
            return Err(DbError::NotFound(format!("incident {}", incident.id)));
        }
        state.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn insert_history(&mut self, mut row: HistoryRow) -> Result<HistoryId, DbError> {
        let state = self.state()?;
        state.next_history_id += 1;
        row.id = state.next_history_id;
        let id = row.id;
        state.history.push(row);
        Ok(id)
    }

    async fn upsert_incident_rule(
        &mut self,
        incident_id: IncidentId,
        rule_id: RuleId,
    ) -> Result<(), DbError> {
        let state = self.state()?;
        if !state.incident_rules.contains(&(incident_id, rule_id)) {
            state.incident_rules.push((incident_id, rule_id));
        }
        Ok(())
    }

    async fn upsert_incident_contact(
        &mut self,
        incident_id: IncidentId,
        key: RecipientKey,
        role: ContactRole,
    ) -> Result<(), DbError> {
        self.state()?
            .incident_contacts
            .insert((incident_id, key), role);
        Ok(())
    }

    async fn upsert_escalation_state(
        &mut self,
        incident_id: IncidentId,
        escalation_id: i64,
        triggered_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.state()?
            .escalation_states
            .insert((incident_id, escalation_id), triggered_at);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        if self.undo.is_none() {
            return Err(DbError::TransactionClosed);
        }
        self.undo = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        match self.undo.take() {
            Some(undo) => {
                *self.guard = undo;
                Ok(())
            }
            None => Err(DbError::TransactionClosed),
        }
    }
}
