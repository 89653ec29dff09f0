//! Addressable notification targets.
//!
//! A rule escalation names recipients that are either a single contact,
//! a contact group, or an on-call schedule. All three resolve to a set
//! of concrete contacts for a given point in time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a recipient as referenced by escalations and stored on
/// incidents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RecipientKey {
    Contact(i64),
    Group(i64),
    Schedule(i64),
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientKey::Contact(id) => write!(f, "contact/{id}"),
            RecipientKey::Group(id) => write!(f, "group/{id}"),
            RecipientKey::Schedule(id) => write!(f, "schedule/{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub full_name: String,
    /// Login name acknowledgement events carry in `username`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub default_channel: String,
    /// Per-channel addresses, e.g. `email -> alice@example.com`.
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub members: Vec<Arc<Contact>>,
}

/// One on-call shift of a schedule.
#[derive(Debug, Clone)]
pub struct ScheduleShift {
    pub contact: Arc<Contact>,
    pub start: DateTime<Utc>,
    /// Open-ended when `None`.
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub shifts: Vec<ScheduleShift>,
}

impl Schedule {
    /// Contacts on call at `t`.
    pub fn contacts_at(&self, t: DateTime<Utc>) -> Vec<Arc<Contact>> {
        let mut result: Vec<Arc<Contact>> = Vec::new();
        for shift in &self.shifts {
            if shift.start <= t && shift.end.map_or(true, |end| t < end) {
                if !result.iter().any(|c| c.id == shift.contact.id) {
                    result.push(Arc::clone(&shift.contact));
                }
            }
        }
        result
    }
}

/// A resolved recipient. Group members and schedule shifts are bound at
/// snapshot-build time, so resolving contacts is lookup-free.
#[derive(Debug, Clone)]
pub enum Recipient {
    Contact(Arc<Contact>),
    Group(Arc<Group>),
    Schedule(Arc<Schedule>),
}

impl Recipient {
    pub fn key(&self) -> RecipientKey {
        match self {
            Recipient::Contact(c) => RecipientKey::Contact(c.id),
            Recipient::Group(g) => RecipientKey::Group(g.id),
            Recipient::Schedule(s) => RecipientKey::Schedule(s.id),
        }
    }

    /// The concrete contacts behind this recipient at `t`. Schedules
    /// return their current on-call set; contacts and groups are
    /// time-independent.
    pub fn contacts_at(&self, t: DateTime<Utc>) -> Vec<Arc<Contact>> {
        match self {
            Recipient::Contact(c) => vec![Arc::clone(c)],
            Recipient::Group(g) => g.members.clone(),
            Recipient::Schedule(s) => s.contacts_at(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contact(id: i64, name: &str) -> Arc<Contact> {
        Arc::new(Contact {
            id,
            full_name: name.to_string(),
            username: Some(name.to_lowercase()),
            default_channel: "email".to_string(),
            addresses: BTreeMap::new(),
        })
    }

    #[test]
    fn schedule_returns_only_on_call_contacts() {
        let alice = contact(1, "Alice");
        let bob = contact(2, "Bob");
        let shift_change = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        let schedule = Schedule {
            id: 1,
            name: "on-call".to_string(),
            shifts: vec![
                ScheduleShift {
                    contact: Arc::clone(&alice),
                    start: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
                    end: Some(shift_change),
                },
                ScheduleShift {
                    contact: Arc::clone(&bob),
                    start: shift_change,
                    end: None,
                },
            ],
        };

        let before = schedule.contacts_at(shift_change - chrono::Duration::hours(1));
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, alice.id);

        // The shift boundary belongs to the incoming contact.
        let at = schedule.contacts_at(shift_change);
        assert_eq!(at.len(), 1);
        assert_eq!(at[0].id, bob.id);
    }

    #[test]
    fn group_resolves_to_all_members() {
        let group = Recipient::Group(Arc::new(Group {
            id: 9,
            name: "ops".to_string(),
            members: vec![contact(1, "Alice"), contact(2, "Bob")],
        }));
        assert_eq!(group.contacts_at(Utc::now()).len(), 2);
        assert_eq!(group.key(), RecipientKey::Group(9));
    }

    #[test]
    fn recipient_key_serializes_tagged() {
        let key = RecipientKey::Schedule(4);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"kind":"schedule","id":4}"#);
        let back: RecipientKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
