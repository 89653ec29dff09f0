//! The incident engine.
//!
//! One incident per object at most. Events for the same object are
//! serialized by the per-incident mutex; the global map mutex is held
//! only for lookup and insert. Every state transition of an incident is
//! written through one database transaction whose commit is the commit
//! point for the whole event, including pending `notified` rows.

mod engine;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::core::{ContactRole, IncidentId, ObjectId, RuleId, Severity, SourceId};
use crate::object::Object;
use crate::recipient::RecipientKey;

pub use engine::{DispatchDescriptor, IncidentEngine};

/// Trigger record of one escalation on one incident.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EscalationState {
    pub triggered_at: DateTime<Utc>,
}

/// An open (or just-closed) problem lifecycle for one object.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: IncidentId,
    pub object_id: ObjectId,
    pub started_at: DateTime<Utc>,
    pub recovered_at: Option<DateTime<Utc>>,

    /// Aggregate severity: the maximum over `severity_by_source`.
    pub severity: Severity,
    /// Last reported problem severity per source. Sources that
    /// recovered to OK are removed.
    pub severity_by_source: HashMap<SourceId, Severity>,

    pub rules_matched: BTreeSet<RuleId>,
    pub escalation_states: HashMap<i64, EscalationState>,

    #[serde(serialize_with = "serialize_recipients")]
    pub recipients: HashMap<RecipientKey, ContactRole>,

    /// Mute state of the object when the incident opened, kept current
    /// on later mute transitions.
    pub is_muted: bool,
}

impl Incident {
    /// A freshly opened incident for a problem state event. The id is
    /// assigned on insert.
    pub fn open(obj: &Object, source_id: SourceId, severity: Severity, time: DateTime<Utc>) -> Self {
        let mut severity_by_source = HashMap::new();
        severity_by_source.insert(source_id, severity);
        Self {
            id: 0,
            object_id: obj.id,
            started_at: time,
            recovered_at: None,
            severity,
            severity_by_source,
            rules_matched: BTreeSet::new(),
            escalation_states: HashMap::new(),
            recipients: HashMap::new(),
            is_muted: obj.is_muted(),
        }
    }

    /// Recomputes the aggregate from the per-source severities. An
    /// incident with no remaining problem source aggregates to OK.
    pub fn aggregate_severity(&self) -> Severity {
        self.severity_by_source
            .values()
            .copied()
            .max()
            .unwrap_or(Severity::Ok)
    }

    pub fn has_manager(&self) -> bool {
        self.recipients
            .values()
            .any(|role| *role == ContactRole::Manager)
    }
}

fn serialize_recipients<S: Serializer>(
    recipients: &HashMap<RecipientKey, ContactRole>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Entry {
        #[serde(flatten)]
        key: RecipientKey,
        role: ContactRole,
    }
    let mut entries: Vec<Entry> = recipients
        .iter()
        .map(|(&key, &role)| Entry { key, role })
        .collect();
    entries.sort_by_key(|e| e.key);
    serializer.collect_seq(entries)
}
