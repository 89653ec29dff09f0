use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    ContactRole, EventId, HistoryId, IncidentId, RuleId, Severity, SourceId,
};
use crate::recipient::RecipientKey;

/// Kind tag of an append-only incident history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryKind {
    Opened,
    Closed,
    SeverityChanged,
    RuleMatched,
    EscalationTriggered,
    RecipientRoleChanged,
    Notified,
    Muted,
    Unmuted,
}

/// Delivery state of a `notified` history row. Inserted as `Pending`
/// (or `Suppressed` for muted objects) in the same transaction as the
/// state change it belongs to, updated after the send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifiedState {
    Pending,
    Sent,
    Failed,
    Suppressed,
}

/// One row of the incident history log. Only the columns relevant for
/// the row's kind are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    #[serde(default)]
    pub id: HistoryId,
    pub incident_id: IncidentId,
    pub time: DateTime<Utc>,
    pub kind: HistoryKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<HistoryId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_severity: Option<Severity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<RecipientKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_role: Option<ContactRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_role: Option<ContactRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_state: Option<NotifiedState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HistoryRow {
    pub fn new(incident_id: IncidentId, time: DateTime<Utc>, kind: HistoryKind) -> Self {
        Self {
            id: 0,
            incident_id,
            time,
            kind,
            event_id: None,
            caused_by: None,
            rule_id: None,
            escalation_id: None,
            old_severity: None,
            new_severity: None,
            recipient: None,
            old_role: None,
            new_role: None,
            contact_id: None,
            channel: None,
            notified_state: None,
            sent_at: None,
            message: None,
        }
    }
}

// --- runtime-configuration tables -----------------------------------------
//
// Raw rows as stored; the runtime cache parses filter and condition
// expressions and validates references when it builds a snapshot.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: SourceId,
    pub name: String,
    /// `icinga2` sources get a stream client; `generic` sources push
    /// through the listener only.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_pass: Option<String>,
    #[serde(default)]
    pub insecure_tls: bool,
    /// Secret a source presents when pushing events through the
    /// listener, as basic auth `source-<id>:<password>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRow {
    pub id: RuleId,
    pub name: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeperiod_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRow {
    pub id: i64,
    pub rule_id: RuleId,
    pub name: String,
    /// Condition expression, e.g. `age>=5m`, `severity>=crit`. `None`
    /// triggers immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecipientRow {
    pub escalation_id: i64,
    pub recipient: RecipientKey,
    /// Overrides the contact's default channel for this escalation only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRow {
    pub id: i64,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub default_channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactAddressRow {
    pub contact_id: i64,
    pub channel: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberRow {
    pub group_id: i64,
    pub contact_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub id: i64,
    pub name: String,
}

/// One on-call shift. A contact is on call at `t` iff
/// `start <= t < end` (open-ended when `end` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntryRow {
    pub schedule_id: i64,
    pub contact_id: i64,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeperiodRow {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeperiodEntryRow {
    pub timeperiod_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: i64,
    /// Channel type tag, matches the plugin's advertised type
    /// (e.g. `email`).
    pub channel_type: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One consistent load of every runtime-configuration table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeTables {
    pub sources: Vec<SourceRow>,
    pub rules: Vec<RuleRow>,
    pub escalations: Vec<EscalationRow>,
    pub escalation_recipients: Vec<EscalationRecipientRow>,
    pub contacts: Vec<ContactRow>,
    pub contact_addresses: Vec<ContactAddressRow>,
    pub groups: Vec<GroupRow>,
    pub group_members: Vec<GroupMemberRow>,
    pub schedules: Vec<ScheduleRow>,
    pub schedule_entries: Vec<ScheduleEntryRow>,
    pub timeperiods: Vec<TimeperiodRow>,
    pub timeperiod_entries: Vec<TimeperiodEntryRow>,
    pub channels: Vec<ChannelRow>,
}
