//! Durable history of objects, events and incidents.
//!
//! The daemon talks to storage exclusively through the [`Database`] and
//! [`DbTransaction`] traits. A transaction spans exactly one inbound
//! event; its commit is the commit point of every state change derived
//! from that event, including pending `notified` rows. Concrete SQL
//! drivers implement these traits outside this crate; [`memory`]
//! provides the built-in reference implementation.

mod memory;
mod rows;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::DatabaseConfig;
use crate::core::{ContactRole, DbError, Event, EventId, HistoryId, IncidentId, RuleId};
use crate::incident::Incident;
use crate::object::Object;
use crate::recipient::RecipientKey;

pub use memory::MemoryDatabase;
pub use rows::{
    ChannelRow, ContactAddressRow, ContactRow, EscalationRecipientRow, EscalationRow,
    GroupMemberRow, GroupRow, HistoryKind, HistoryRow, NotifiedState, RuleRow, RuntimeTables,
    ScheduleEntryRow, ScheduleRow, SourceRow, TimeperiodEntryRow, TimeperiodRow,
};

#[async_trait]
pub trait Database: Send + Sync {
    /// Opens the per-event transaction. At most one transaction is
    /// active per object at any time; the incident engine guarantees
    /// this through its per-incident lock.
    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DbError>;

    /// Loads every runtime-configuration table in one consistent sweep.
    async fn load_runtime_tables(&self) -> Result<RuntimeTables, DbError>;

    /// Objects that are muted but have no open incident. Loaded at
    /// startup so their next events are not misclassified.
    async fn restore_muted_objects(&self) -> Result<Vec<Object>, DbError>;

    /// Open incidents (`recovered_at IS NULL`) with their objects,
    /// loaded at startup.
    async fn load_open_incidents(&self) -> Result<Vec<(Incident, Object)>, DbError>;

    /// Post-send update of a `notified` history row. Runs outside the
    /// event transaction; delivery outcome never rolls back incident
    /// state.
    async fn update_notified(
        &self,
        history_id: HistoryId,
        state: NotifiedState,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError>;
}

#[async_trait]
pub trait DbTransaction: Send {
    async fn upsert_object(&mut self, obj: &Object) -> Result<(), DbError>;

    /// Inserts the event and returns its assigned id.
    async fn insert_event(&mut self, ev: &Event) -> Result<EventId, DbError>;

    /// Inserts a freshly opened incident and returns its assigned id.
    async fn insert_incident(&mut self, incident: &Incident) -> Result<IncidentId, DbError>;

    /// Updates severity, per-source severities and `recovered_at`.
    async fn update_incident(&mut self, incident: &Incident) -> Result<(), DbError>;

    /// Appends one history row and returns its id. History is
    /// append-only; ids increase monotonically per incident.
    async fn insert_history(&mut self, row: HistoryRow) -> Result<HistoryId, DbError>;

    async fn upsert_incident_rule(
        &mut self,
        incident_id: IncidentId,
        rule_id: RuleId,
    ) -> Result<(), DbError>;

    async fn upsert_incident_contact(
        &mut self,
        incident_id: IncidentId,
        key: RecipientKey,
        role: ContactRole,
    ) -> Result<(), DbError>;

    async fn upsert_escalation_state(
        &mut self,
        incident_id: IncidentId,
        escalation_id: i64,
        triggered_at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// Opens the configured database. Only the built-in `memory` driver is
/// known to this crate; SQL drivers register through the [`Database`]
/// trait from the embedding binary.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Database>, DbError> {
    match config.driver.as_str() {
        "memory" => Ok(Arc::new(MemoryDatabase::new())),
        other => Err(DbError::UnsupportedDriver(other.to_string())),
    }
}
