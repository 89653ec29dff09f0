use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::{EscalationState, Incident};
use crate::core::{
    ContactRole, DbError, Event, EventId, EventType, HistoryId, ObjectId, ProcessError, Severity,
};
use crate::db::{Database, DbTransaction, HistoryKind, HistoryRow, NotifiedState};
use crate::object::{MuteChange, Object, ObjectRegistry};
use crate::recipient::{Contact, RecipientKey};
use crate::runtime::{EscalationContext, EscalationRecipient, RuntimeCache, RuntimeConfig};

/// One notification to be delivered by the dispatcher, created after
/// its pending `notified` row was committed.
#[derive(Debug, Clone)]
pub struct DispatchDescriptor {
    pub history_id: HistoryId,
    pub contact: Arc<Contact>,
    pub channel: String,
    pub incident: Incident,
    pub object: Object,
    pub event: Event,
}

struct Outcome {
    closed: bool,
    dispatches: Vec<DispatchDescriptor>,
}

/// Correlates events into incidents and advances their state machine.
pub struct IncidentEngine {
    db: Arc<dyn Database>,
    registry: Arc<ObjectRegistry>,
    runtime: Arc<RuntimeCache>,
    current: Mutex<HashMap<ObjectId, Arc<Mutex<Incident>>>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchDescriptor>,
}

impl IncidentEngine {
    pub fn new(
        db: Arc<dyn Database>,
        registry: Arc<ObjectRegistry>,
        runtime: Arc<RuntimeCache>,
        dispatch_tx: mpsc::UnboundedSender<DispatchDescriptor>,
    ) -> Self {
        Self {
            db,
            registry,
            runtime,
            current: Mutex::new(HashMap::new()),
            dispatch_tx,
        }
    }

    /// Processes one validated event to completion: resolves the
    /// object, advances (or opens) the incident under its lock, commits
    /// the transaction and hands finished dispatches to the dispatcher.
    pub async fn process_event(&self, ev: Event) -> Result<(), ProcessError> {
        ev.validate()?;

        let mut obj = self.registry.resolve(&ev).await;

        let (incident_arc, created) = {
            let mut current = self.current.lock().await;
            match current.get(&obj.id) {
                Some(arc) => (Some(Arc::clone(arc)), false),
                None => match ev.event_type {
                    EventType::State if ev.severity.is_problem() => {
                        let incident = Incident::open(&obj, ev.source_id, ev.severity, ev.time);
                        let arc = Arc::new(Mutex::new(incident));
                        current.insert(obj.id, Arc::clone(&arc));
                        (Some(arc), true)
                    }
                    EventType::State => return Err(ProcessError::SuperfluousStateChange),
                    EventType::AcknowledgementSet => return Err(ProcessError::NoOpenIncident),
                    _ => (None, false),
                },
            }
        };

        // Mute bookkeeping happens only for events that are accepted.
        let mute_change = self.registry.apply_mute(&ev).await;
        if mute_change.is_some() {
            // Pick up the post-transition mute reasons for persistence.
            if let Some(updated) = self.registry.get(&obj.id).await {
                obj = updated;
            }
        }

        let Some(incident_arc) = incident_arc else {
            // No incident and none to open. Events conveying
            // object-level state are still persisted.
            return self.persist_event_without_incident(&ev, &obj).await;
        };

        let mut incident = incident_arc.lock().await;
        let cfg = self.runtime.read().await;

        // Work on a copy so a failed transaction leaves the in-memory
        // incident exactly as the database sees it.
        let mut work = incident.clone();
        let outcome = self
            .process_locked(&mut work, created, &obj, &ev, mute_change, &cfg)
            .await;

        match outcome {
            Ok(outcome) => {
                *incident = work;
                if outcome.closed {
                    // Remove while the incident lock is held so a
                    // concurrent event cannot pick up the closed entry.
                    self.current.lock().await.remove(&obj.id);
                    info!(incident = incident.id, object = %obj.name, "incident closed");
                }
                drop(cfg);
                drop(incident);
                for descriptor in outcome.dispatches {
                    if self.dispatch_tx.send(descriptor).is_err() {
                        warn!("notification dispatcher is gone, dropping dispatch");
                    }
                }
                Ok(())
            }
            Err(err) => {
                if created {
                    self.current.lock().await.remove(&obj.id);
                }
                Err(err)
            }
        }
    }

    async fn process_locked(
        &self,
        incident: &mut Incident,
        created: bool,
        obj: &Object,
        ev: &Event,
        mute_change: Option<MuteChange>,
        cfg: &RuntimeConfig,
    ) -> Result<Outcome, ProcessError> {
        let mut tx = self.db.begin().await?;
        tx.upsert_object(obj).await?;
        let event_id = tx.insert_event(ev).await?;

        // History rows derived from rule evaluation reference the row
        // that caused them: the opened row or the severity change.
        let mut anchor: Option<HistoryId> = None;

        if created {
            incident.id = tx.insert_incident(incident).await?;
            let mut row = HistoryRow::new(incident.id, ev.time, HistoryKind::Opened);
            row.event_id = Some(event_id);
            anchor = Some(tx.insert_history(row).await?);
            info!(
                incident = incident.id,
                object = %obj.name,
                severity = %incident.severity,
                "incident opened"
            );
        }

        if let Some(change) = mute_change {
            if change.changed {
                incident.is_muted = change.muted;
                let kind = if change.muted {
                    HistoryKind::Muted
                } else {
                    HistoryKind::Unmuted
                };
                let mut row = HistoryRow::new(incident.id, ev.time, kind);
                row.event_id = Some(event_id);
                row.message = ev.mute_transition().map(|(reason, _)| reason.to_string());
                tx.insert_history(row).await?;
            }
        }

        match ev.event_type {
            EventType::AcknowledgementSet => {
                self.apply_acknowledgement(incident, ev, event_id, cfg, &mut tx)
                    .await?;
                tx.commit().await?;
                return Ok(Outcome {
                    closed: false,
                    dispatches: Vec::new(),
                });
            }
            EventType::AcknowledgementCleared => {
                // The manager keeps the role when the acknowledgement
                // goes away; only the mute reason is lifted.
                tx.commit().await?;
                return Ok(Outcome {
                    closed: false,
                    dispatches: Vec::new(),
                });
            }
            EventType::State if !created => {
                let previous = incident
                    .severity_by_source
                    .get(&ev.source_id)
                    .copied()
                    .unwrap_or(Severity::Ok);
                if previous == ev.severity {
                    return Err(ProcessError::SuperfluousStateChange);
                }
                if ev.severity == Severity::Ok {
                    incident.severity_by_source.remove(&ev.source_id);
                } else {
                    incident.severity_by_source.insert(ev.source_id, ev.severity);
                }

                let mut row = HistoryRow::new(incident.id, ev.time, HistoryKind::SeverityChanged);
                row.event_id = Some(event_id);
                row.old_severity = Some(previous);
                row.new_severity = Some(ev.severity);
                anchor = Some(tx.insert_history(row).await?);

                incident.severity = incident.aggregate_severity();
                if incident.severity == Severity::Ok {
                    incident.recovered_at = Some(ev.time);
                    let mut row = HistoryRow::new(incident.id, ev.time, HistoryKind::Closed);
                    row.event_id = Some(event_id);
                    tx.insert_history(row).await?;
                    tx.update_incident(incident).await?;
                    tx.commit().await?;
                    return Ok(Outcome {
                        closed: true,
                        dispatches: Vec::new(),
                    });
                }
                tx.update_incident(incident).await?;
            }
            _ => {}
        }

        // Rule evaluation: every active rule not yet matched.
        for rule in cfg.rules() {
            if incident.rules_matched.contains(&rule.id) || !rule.applies(&obj.tags, ev.time) {
                continue;
            }
            incident.rules_matched.insert(rule.id);
            tx.upsert_incident_rule(incident.id, rule.id).await?;
            let mut row = HistoryRow::new(incident.id, ev.time, HistoryKind::RuleMatched);
            row.event_id = Some(event_id);
            row.caused_by = anchor;
            row.rule_id = Some(rule.id);
            tx.insert_history(row).await?;
            debug!(incident = incident.id, rule = %rule.name, "rule matched");
        }

        // Escalation evaluation for all matched rules.
        let ctx = EscalationContext {
            age: ev.time - incident.started_at,
            severity: incident.severity,
        };
        let mut enqueued: Vec<EscalationRecipient> = Vec::new();
        let matched: Vec<_> = incident.rules_matched.iter().copied().collect();
        for rule_id in matched {
            let Some(rule) = cfg.rule(rule_id) else {
                warn!(rule = rule_id, "matched rule vanished from configuration, skipping");
                continue;
            };
            for escalation in &rule.escalations {
                if incident.escalation_states.contains_key(&escalation.id)
                    || !escalation.condition.matches(&ctx)
                {
                    continue;
                }
                incident.escalation_states.insert(
                    escalation.id,
                    EscalationState {
                        triggered_at: ev.time,
                    },
                );
                tx.upsert_escalation_state(incident.id, escalation.id, ev.time)
                    .await?;
                let mut row =
                    HistoryRow::new(incident.id, ev.time, HistoryKind::EscalationTriggered);
                row.event_id = Some(event_id);
                row.caused_by = anchor;
                row.rule_id = Some(rule_id);
                row.escalation_id = Some(escalation.id);
                tx.insert_history(row).await?;
                info!(
                    incident = incident.id,
                    escalation = %escalation.name,
                    "escalation triggered"
                );
                enqueued.extend(escalation.recipients.iter().cloned());
            }
        }

        // Newly arriving recipients get the recipient role, or
        // subscriber once a manager exists. Roles only move upward.
        let default_role = if incident.has_manager() {
            ContactRole::Subscriber
        } else {
            ContactRole::Recipient
        };
        for entry in &enqueued {
            let key = entry.recipient.key();
            let old = incident.recipients.get(&key).copied();
            let new_role = old.map_or(default_role, |role| role.max(default_role));
            if Some(new_role) == old {
                continue;
            }
            incident.recipients.insert(key, new_role);
            tx.upsert_incident_contact(incident.id, key, new_role).await?;
            let mut row =
                HistoryRow::new(incident.id, ev.time, HistoryKind::RecipientRoleChanged);
            row.event_id = Some(event_id);
            row.recipient = Some(key);
            row.old_role = old;
            row.new_role = Some(new_role);
            tx.insert_history(row).await?;
        }

        // Notification build: resolve recipients to concrete contacts,
        // dedup per (contact, channel).
        let muted = mute_change.map(|c| c.muted).unwrap_or_else(|| obj.is_muted());
        let mut pairs: BTreeMap<(i64, String), Arc<Contact>> = BTreeMap::new();
        for entry in &enqueued {
            for contact in entry.recipient.contacts_at(ev.time) {
                let channel = entry
                    .channel
                    .clone()
                    .unwrap_or_else(|| contact.default_channel.clone());
                pairs.entry((contact.id, channel)).or_insert(contact);
            }
        }

        let mut stored_event = ev.clone();
        stored_event.id = Some(event_id);
        let mut dispatches = Vec::new();
        for ((contact_id, channel), contact) in pairs {
            let mut row = HistoryRow::new(incident.id, ev.time, HistoryKind::Notified);
            row.event_id = Some(event_id);
            row.contact_id = Some(contact_id);
            row.channel = Some(channel.clone());
            row.notified_state = Some(if muted {
                NotifiedState::Suppressed
            } else {
                NotifiedState::Pending
            });
            let history_id = tx.insert_history(row).await?;
            if !muted {
                dispatches.push(DispatchDescriptor {
                    history_id,
                    contact,
                    channel,
                    incident: incident.clone(),
                    object: obj.clone(),
                    event: stored_event.clone(),
                });
            }
        }

        tx.commit().await?;
        Ok(Outcome {
            closed: false,
            dispatches,
        })
    }

    async fn apply_acknowledgement(
        &self,
        incident: &mut Incident,
        ev: &Event,
        event_id: EventId,
        cfg: &RuntimeConfig,
        tx: &mut Box<dyn DbTransaction>,
    ) -> Result<(), ProcessError> {
        let Some(username) = ev.username.as_deref() else {
            warn!(
                incident = incident.id,
                "acknowledgement without username, recording event only"
            );
            return Ok(());
        };
        let Some(contact) = cfg.contact_by_username(username) else {
            warn!(
                incident = incident.id,
                username, "acknowledgement by unknown contact, recording event only"
            );
            return Ok(());
        };

        let key = RecipientKey::Contact(contact.id);
        let old = incident.recipients.get(&key).copied();
        if old == Some(ContactRole::Manager) {
            debug!(incident = incident.id, username, "contact already manages the incident");
            return Ok(());
        }

        incident.recipients.insert(key, ContactRole::Manager);
        tx.upsert_incident_contact(incident.id, key, ContactRole::Manager)
            .await?;
        let mut row = HistoryRow::new(incident.id, ev.time, HistoryKind::RecipientRoleChanged);
        row.event_id = Some(event_id);
        row.recipient = Some(key);
        row.old_role = old;
        row.new_role = Some(ContactRole::Manager);
        row.contact_id = Some(contact.id);
        row.message = ev.message.clone();
        tx.insert_history(row).await?;
        info!(
            incident = incident.id,
            username, "contact promoted to incident manager"
        );
        Ok(())
    }

    async fn persist_event_without_incident(
        &self,
        ev: &Event,
        obj: &Object,
    ) -> Result<(), ProcessError> {
        if ev.event_type == EventType::Internal {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        tx.upsert_object(obj).await?;
        tx.insert_event(ev).await?;
        tx.commit().await?;
        debug!(object = %obj.name, event = %ev.event_type, "event recorded without incident");
        Ok(())
    }

    /// Reloads open incidents and their objects after a restart.
    pub async fn restore(&self) -> Result<usize, DbError> {
        let open = self.db.load_open_incidents().await?;
        let count = open.len();
        let mut current = self.current.lock().await;
        for (incident, obj) in open {
            self.registry.insert(obj).await;
            current.insert(incident.object_id, Arc::new(Mutex::new(incident)));
        }
        Ok(count)
    }

    /// Synthesizes an internal event for every reloaded open incident
    /// so time-based escalations missed while the daemon was down still
    /// fire.
    pub async fn retrigger_open(&self) -> usize {
        let ids: Vec<ObjectId> = self.current.lock().await.keys().copied().collect();
        let mut count = 0;
        for id in ids {
            let Some(obj) = self.registry.get(&id).await else {
                continue;
            };
            let ev = Event {
                id: None,
                time: Utc::now(),
                source_id: obj.source_id,
                name: obj.name.clone(),
                url: obj.url.clone(),
                tags: obj.tags.clone(),
                extra_tags: obj.extra_tags.clone(),
                event_type: EventType::Internal,
                severity: Severity::None,
                mute_reason: None,
                username: None,
                message: None,
            };
            match self.process_event(ev).await {
                Ok(()) => count += 1,
                Err(err) if err.is_benign() => {}
                Err(err) => warn!(object = %obj.name, %err, "retrigger failed"),
            }
        }
        count
    }

    /// Snapshot of all open incidents, for diagnostics.
    pub async fn dump(&self) -> Vec<Incident> {
        let arcs: Vec<_> = self.current.lock().await.values().cloned().collect();
        let mut incidents = Vec::with_capacity(arcs.len());
        for arc in arcs {
            incidents.push(arc.lock().await.clone());
        }
        incidents.sort_by_key(|i| i.id);
        incidents
    }

    /// Whether an object currently has an open incident.
    pub async fn has_open_incident(&self, id: &ObjectId) -> bool {
        self.current.lock().await.contains_key(id)
    }
}
