//! Runtime configuration cache.
//!
//! Rules, escalations, recipients, schedules, channels and sources live
//! in database tables that can change at any time. A background task
//! reloads them periodically, parses filter and condition expressions
//! into evaluable form, and publishes an immutable snapshot. Event
//! processing holds a read lock on the snapshot for the duration of one
//! event; the refresh task blocks only to swap the snapshot pointer.

mod filter;
mod rule;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{DbError, RuleId, SourceId};
use crate::db::{ChannelRow, Database, RuntimeTables, SourceRow};
use crate::recipient::{Contact, Group, Recipient, RecipientKey, Schedule, ScheduleShift};

pub use filter::{FilterParseError, ObjectFilter};
pub use rule::{
    CmpOp, Condition, ConditionParseError, Escalation, EscalationContext, EscalationRecipient,
    Rule, Timeperiod,
};

/// One immutable, fully parsed configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    rules: HashMap<RuleId, Arc<Rule>>,
    escalations: HashMap<i64, Arc<Escalation>>,
    contacts: HashMap<i64, Arc<Contact>>,
    contacts_by_username: HashMap<String, Arc<Contact>>,
    groups: HashMap<i64, Arc<Group>>,
    schedules: HashMap<i64, Arc<Schedule>>,
    channels: HashMap<String, Arc<ChannelRow>>,
    sources: HashMap<SourceId, Arc<SourceRow>>,
}

impl RuntimeConfig {
    pub fn rule(&self, id: RuleId) -> Option<&Arc<Rule>> {
        self.rules.get(&id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values()
    }

    pub fn escalation(&self, id: i64) -> Option<&Arc<Escalation>> {
        self.escalations.get(&id)
    }

    pub fn contact(&self, id: i64) -> Option<&Arc<Contact>> {
        self.contacts.get(&id)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Arc<Contact>> {
        self.contacts.values()
    }

    pub fn contact_by_username(&self, username: &str) -> Option<&Arc<Contact>> {
        self.contacts_by_username.get(username)
    }

    pub fn recipient(&self, key: RecipientKey) -> Option<Recipient> {
        match key {
            RecipientKey::Contact(id) => self.contacts.get(&id).cloned().map(Recipient::Contact),
            RecipientKey::Group(id) => self.groups.get(&id).cloned().map(Recipient::Group),
            RecipientKey::Schedule(id) => {
                self.schedules.get(&id).cloned().map(Recipient::Schedule)
            }
        }
    }

    pub fn channel(&self, channel_type: &str) -> Option<&Arc<ChannelRow>> {
        self.channels.get(channel_type)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<ChannelRow>> {
        self.channels.values()
    }

    pub fn source(&self, id: SourceId) -> Option<&Arc<SourceRow>> {
        self.sources.get(&id)
    }

    pub fn sources(&self) -> &HashMap<SourceId, Arc<SourceRow>> {
        &self.sources
    }

    /// Builds a snapshot from raw tables. Rows that fail to parse or
    /// reference missing rows are skipped with a warning; processing
    /// must go on with the remaining configuration.
    pub fn from_tables(tables: RuntimeTables) -> Self {
        let mut cfg = RuntimeConfig::default();

        for row in tables.contacts {
            let contact = Arc::new(Contact {
                id: row.id,
                full_name: row.full_name,
                username: row.username,
                default_channel: row.default_channel,
                addresses: tables
                    .contact_addresses
                    .iter()
                    .filter(|a| a.contact_id == row.id)
                    .map(|a| (a.channel.clone(), a.address.clone()))
                    .collect(),
            });
            if let Some(username) = &contact.username {
                cfg.contacts_by_username
                    .insert(username.clone(), Arc::clone(&contact));
            }
            cfg.contacts.insert(contact.id, contact);
        }

        for row in tables.groups {
            let mut members = Vec::new();
            for member in tables.group_members.iter().filter(|m| m.group_id == row.id) {
                match cfg.contacts.get(&member.contact_id) {
                    Some(contact) => members.push(Arc::clone(contact)),
                    None => warn!(
                        group = row.id,
                        contact = member.contact_id,
                        "skipping dangling group member"
                    ),
                }
            }
            cfg.groups
                .insert(row.id, Arc::new(Group { id: row.id, name: row.name, members }));
        }

        for row in tables.schedules {
            let mut shifts = Vec::new();
            for entry in tables
                .schedule_entries
                .iter()
                .filter(|e| e.schedule_id == row.id)
            {
                match cfg.contacts.get(&entry.contact_id) {
                    Some(contact) => shifts.push(ScheduleShift {
                        contact: Arc::clone(contact),
                        start: entry.start,
                        end: entry.end,
                    }),
                    None => warn!(
                        schedule = row.id,
                        contact = entry.contact_id,
                        "skipping dangling schedule entry"
                    ),
                }
            }
            cfg.schedules
                .insert(row.id, Arc::new(Schedule { id: row.id, name: row.name, shifts }));
        }

        let mut timeperiods: HashMap<i64, Arc<Timeperiod>> = HashMap::new();
        for row in tables.timeperiods {
            let entries = tables
                .timeperiod_entries
                .iter()
                .filter(|e| e.timeperiod_id == row.id)
                .map(|e| (e.start, e.end))
                .collect();
            timeperiods.insert(
                row.id,
                Arc::new(Timeperiod { id: row.id, name: row.name, entries }),
            );
        }

        // Escalations first, grouped per rule below.
        for row in tables.escalations {
            let condition = match Condition::parse(row.condition.as_deref().unwrap_or("")) {
                Ok(cond) => cond,
                Err(err) => {
                    warn!(escalation = row.id, %err, "skipping escalation with bad condition");
                    continue;
                }
            };
            let mut recipients = Vec::new();
            for rec in tables
                .escalation_recipients
                .iter()
                .filter(|r| r.escalation_id == row.id)
            {
                match cfg.recipient(rec.recipient) {
                    Some(recipient) => recipients.push(EscalationRecipient {
                        recipient,
                        channel: rec.channel.clone(),
                    }),
                    None => warn!(
                        escalation = row.id,
                        recipient = %rec.recipient,
                        "skipping dangling escalation recipient"
                    ),
                }
            }
            cfg.escalations.insert(
                row.id,
                Arc::new(Escalation {
                    id: row.id,
                    rule_id: row.rule_id,
                    name: row.name,
                    condition,
                    recipients,
                }),
            );
        }

        for row in tables.rules {
            if !row.active {
                debug!(rule = row.id, "skipping inactive rule");
                continue;
            }
            let object_filter = match ObjectFilter::parse(row.object_filter.as_deref().unwrap_or(""))
            {
                Ok(filter) => filter,
                Err(err) => {
                    warn!(rule = row.id, %err, "skipping rule with bad object filter");
                    continue;
                }
            };
            let timeperiod = match row.timeperiod_id {
                None => None,
                Some(id) => match timeperiods.get(&id) {
                    Some(tp) => Some(Arc::clone(tp)),
                    None => {
                        warn!(rule = row.id, timeperiod = id, "skipping rule with dangling timeperiod");
                        continue;
                    }
                },
            };
            let escalations = cfg
                .escalations
                .values()
                .filter(|e| e.rule_id == row.id)
                .cloned()
                .collect();
            cfg.rules.insert(
                row.id,
                Arc::new(Rule {
                    id: row.id,
                    name: row.name,
                    object_filter,
                    timeperiod,
                    escalations,
                }),
            );
        }

        for row in tables.channels {
            cfg.channels.insert(row.channel_type.clone(), Arc::new(row));
        }
        for row in tables.sources {
            cfg.sources.insert(row.id, Arc::new(row));
        }

        cfg
    }
}

/// Starts and stops stream clients as sources come and go. Implemented
/// by the daemon wiring; injected here so the cache never needs a
/// direct reference to the client machinery.
pub trait SourceLauncher: Send + Sync {
    fn launch(&self, source: Arc<SourceRow>);
    fn stop(&self, source_id: SourceId);
}

/// The shared cache. `read` is consulted on every event.
pub struct RuntimeCache {
    db: Arc<dyn Database>,
    snapshot: RwLock<Arc<RuntimeConfig>>,
}

impl RuntimeCache {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            snapshot: RwLock::new(Arc::new(RuntimeConfig::default())),
        }
    }

    /// Acquires the snapshot read lock. Callers hold the guard for the
    /// duration of processing one event.
    pub async fn read(&self) -> RwLockReadGuard<'_, Arc<RuntimeConfig>> {
        self.snapshot.read().await
    }

    /// Loads all tables and, on success, publishes a new snapshot and
    /// reconciles running stream clients through `launcher`.
    pub async fn refresh(&self, launcher: Option<&dyn SourceLauncher>) -> Result<(), DbError> {
        let tables = self.db.load_runtime_tables().await?;
        let new = Arc::new(RuntimeConfig::from_tables(tables));

        let old = {
            let mut guard = self.snapshot.write().await;
            std::mem::replace(&mut *guard, Arc::clone(&new))
        };

        if let Some(launcher) = launcher {
            for (id, _) in old.sources.iter() {
                if !new.sources.contains_key(id) {
                    info!(source = id, "source removed, stopping client");
                    launcher.stop(*id);
                }
            }
            for (id, source) in new.sources.iter() {
                match old.sources.get(id) {
                    Some(previous) if previous == source => {}
                    Some(_) => {
                        info!(source = id, "source changed, restarting client");
                        launcher.stop(*id);
                        launcher.launch(Arc::clone(source));
                    }
                    None => {
                        info!(source = id, name = %source.name, "new source, starting client");
                        launcher.launch(Arc::clone(source));
                    }
                }
            }
        }

        Ok(())
    }

    /// Periodic refresh loop, one task per process.
    pub async fn run(
        self: Arc<Self>,
        launcher: Arc<dyn SourceLauncher>,
        interval: StdDuration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("runtime config refresh stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh(Some(launcher.as_ref())).await {
                        error!(%err, "runtime config refresh failed, keeping previous snapshot");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        ContactRow, EscalationRecipientRow, EscalationRow, GroupMemberRow, GroupRow, RuleRow,
    };

    fn tables() -> RuntimeTables {
        RuntimeTables {
            contacts: vec![
                ContactRow {
                    id: 1,
                    full_name: "Alice".into(),
                    username: Some("alice".into()),
                    default_channel: "email".into(),
                },
                ContactRow {
                    id: 2,
                    full_name: "Bob".into(),
                    username: None,
                    default_channel: "email".into(),
                },
            ],
            groups: vec![GroupRow { id: 1, name: "ops".into() }],
            group_members: vec![
                GroupMemberRow { group_id: 1, contact_id: 1 },
                GroupMemberRow { group_id: 1, contact_id: 99 },
            ],
            rules: vec![
                RuleRow {
                    id: 1,
                    name: "all".into(),
                    active: true,
                    object_filter: None,
                    timeperiod_id: None,
                },
                RuleRow {
                    id: 2,
                    name: "broken".into(),
                    active: true,
                    object_filter: Some("((".into()),
                    timeperiod_id: None,
                },
                RuleRow {
                    id: 3,
                    name: "inactive".into(),
                    active: false,
                    object_filter: None,
                    timeperiod_id: None,
                },
            ],
            escalations: vec![EscalationRow {
                id: 1,
                rule_id: 1,
                name: "immediately".into(),
                condition: None,
            }],
            escalation_recipients: vec![EscalationRecipientRow {
                escalation_id: 1,
                recipient: RecipientKey::Group(1),
                channel: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn builds_snapshot_and_skips_bad_rows() {
        let cfg = RuntimeConfig::from_tables(tables());

        assert!(cfg.rule(1).is_some());
        assert!(cfg.rule(2).is_none(), "bad filter is skipped");
        assert!(cfg.rule(3).is_none(), "inactive rule is skipped");

        let group = match cfg.recipient(RecipientKey::Group(1)).unwrap() {
            Recipient::Group(g) => g,
            other => panic!("unexpected recipient {other:?}"),
        };
        assert_eq!(group.members.len(), 1, "dangling member is skipped");

        assert_eq!(cfg.contact_by_username("alice").unwrap().id, 1);
        assert_eq!(cfg.rule(1).unwrap().escalations.len(), 1);
    }

    #[tokio::test]
    async fn refresh_publishes_snapshot() {
        let db = Arc::new(crate::db::MemoryDatabase::new());
        db.seed_runtime(tables()).await;

        let cache = RuntimeCache::new(db.clone() as Arc<dyn Database>);
        assert!(cache.read().await.rule(1).is_none());

        cache.refresh(None).await.unwrap();
        assert!(cache.read().await.rule(1).is_some());
    }
}
