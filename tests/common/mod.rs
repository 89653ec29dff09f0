//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use incidentd::core::{Event, EventType, MuteReason, Severity, SourceId};
use incidentd::db::{
    ContactRow, Database, EscalationRecipientRow, EscalationRow, MemoryDatabase, RuleRow,
    RuntimeTables,
};
use incidentd::incident::DispatchDescriptor;
use incidentd::recipient::RecipientKey;
use incidentd::{IncidentEngine, ObjectRegistry, RuntimeCache};

pub struct Harness {
    pub db: Arc<MemoryDatabase>,
    pub registry: Arc<ObjectRegistry>,
    pub runtime: Arc<RuntimeCache>,
    pub engine: Arc<IncidentEngine>,
    pub dispatch_rx: mpsc::UnboundedReceiver<DispatchDescriptor>,
}

/// Builds the full engine stack on a fresh in-memory database seeded
/// with `tables`.
pub async fn harness(tables: RuntimeTables) -> Harness {
    let db = Arc::new(MemoryDatabase::new());
    db.seed_runtime(tables).await;

    let registry = Arc::new(ObjectRegistry::new());
    let runtime = Arc::new(RuntimeCache::new(Arc::clone(&db) as Arc<dyn Database>));
    runtime.refresh(None).await.expect("initial refresh");

    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(IncidentEngine::new(
        Arc::clone(&db) as Arc<dyn Database>,
        Arc::clone(&registry),
        Arc::clone(&runtime),
        dispatch_tx,
    ));

    Harness {
        db,
        registry,
        runtime,
        engine,
        dispatch_rx,
    }
}

/// Runtime tables with one match-everything rule, one immediate
/// escalation and one contact (alice, default channel email).
pub fn simple_tables() -> RuntimeTables {
    RuntimeTables {
        contacts: vec![ContactRow {
            id: 1,
            full_name: "Alice".to_string(),
            username: Some("alice".to_string()),
            default_channel: "email".to_string(),
        }],
        rules: vec![RuleRow {
            id: 1,
            name: "everything".to_string(),
            active: true,
            object_filter: None,
            timeperiod_id: None,
        }],
        escalations: vec![EscalationRow {
            id: 1,
            rule_id: 1,
            name: "immediately".to_string(),
            condition: None,
        }],
        escalation_recipients: vec![EscalationRecipientRow {
            escalation_id: 1,
            recipient: RecipientKey::Contact(1),
            channel: None,
        }],
        ..Default::default()
    }
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn host_tags(host: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("host".to_string(), host.to_string());
    tags
}

pub fn state_event(source_id: SourceId, host: &str, severity: Severity, secs: i64) -> Event {
    Event {
        id: None,
        time: ts(secs),
        source_id,
        name: host.to_string(),
        url: None,
        tags: host_tags(host),
        extra_tags: BTreeMap::new(),
        event_type: EventType::State,
        severity,
        mute_reason: None,
        username: None,
        message: None,
    }
}

pub fn typed_event(source_id: SourceId, host: &str, ty: EventType, secs: i64) -> Event {
    let mut ev = state_event(source_id, host, Severity::None, secs);
    ev.event_type = ty;
    ev
}

pub fn mute_event(source_id: SourceId, host: &str, reason: MuteReason, secs: i64) -> Event {
    let mut ev = typed_event(source_id, host, EventType::Mute, secs);
    ev.mute_reason = Some(reason);
    ev
}
