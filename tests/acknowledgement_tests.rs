//! Acknowledgement tests
//!
//! Acknowledging contacts become incident managers; acknowledgement
//! events never trigger escalations.
//! Run with: cargo test --test acknowledgement_tests

mod common;

use common::*;
use incidentd::core::{ContactRole, EventType, ProcessError, Severity};
use incidentd::db::HistoryKind;
use incidentd::recipient::RecipientKey;

fn ack_event(host: &str, username: &str, secs: i64) -> incidentd::Event {
    let mut ev = typed_event(1, host, EventType::AcknowledgementSet, secs);
    ev.username = Some(username.to_string());
    ev.message = Some("wip".to_string());
    ev
}

#[tokio::test]
async fn acknowledging_contact_becomes_manager() {
    let mut h = harness(simple_tables()).await;

    h.engine
        .process_event(state_event(1, "h1", Severity::Crit, 100))
        .await
        .unwrap();
    // The escalation fired immediately: alice is a plain recipient.
    let incident = &h.db.incidents().await[0];
    assert_eq!(
        incident.recipients.get(&RecipientKey::Contact(1)),
        Some(&ContactRole::Recipient)
    );
    let first = h.dispatch_rx.recv().await.unwrap();
    assert_eq!(first.contact.full_name, "Alice");

    h.engine
        .process_event(ack_event("h1", "alice", 110))
        .await
        .unwrap();

    let incident = &h.db.incidents().await[0];
    assert_eq!(
        incident.recipients.get(&RecipientKey::Contact(1)),
        Some(&ContactRole::Manager)
    );
    assert!(incident.is_muted, "acknowledgement mutes the object");

    let history = h.db.history(incident.id).await;
    let role_changes: Vec<_> = history
        .iter()
        .filter(|row| row.kind == HistoryKind::RecipientRoleChanged)
        .collect();
    assert_eq!(role_changes.len(), 2, "recipient, then manager");
    assert_eq!(role_changes[1].new_role, Some(ContactRole::Manager));
    assert_eq!(role_changes[1].old_role, Some(ContactRole::Recipient));

    // Recovery closes the incident as usual.
    h.engine
        .process_event(state_event(1, "h1", Severity::Ok, 120))
        .await
        .unwrap();
    let incident = &h.db.incidents().await[0];
    assert_eq!(incident.recovered_at, Some(ts(120)));
}

#[tokio::test]
async fn acknowledgement_without_incident_is_rejected() {
    let h = harness(simple_tables()).await;

    let err = h
        .engine
        .process_event(ack_event("h1", "alice", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::NoOpenIncident));
    assert!(h.db.events().await.is_empty());
}

#[tokio::test]
async fn acknowledgement_cleared_keeps_the_manager() {
    let h = harness(simple_tables()).await;

    h.engine
        .process_event(state_event(1, "h1", Severity::Crit, 100))
        .await
        .unwrap();
    h.engine
        .process_event(ack_event("h1", "alice", 110))
        .await
        .unwrap();

    h.engine
        .process_event(typed_event(1, "h1", EventType::AcknowledgementCleared, 120))
        .await
        .unwrap();

    let incident = &h.db.incidents().await[0];
    assert_eq!(
        incident.recipients.get(&RecipientKey::Contact(1)),
        Some(&ContactRole::Manager),
        "role survives the cleared acknowledgement"
    );
    assert!(!incident.is_muted, "mute reason is lifted");
}

#[tokio::test]
async fn unknown_acknowledger_is_recorded_but_grants_nothing() {
    let h = harness(simple_tables()).await;

    h.engine
        .process_event(state_event(1, "h1", Severity::Crit, 100))
        .await
        .unwrap();
    h.engine
        .process_event(ack_event("h1", "mallory", 110))
        .await
        .unwrap();

    let incident = &h.db.incidents().await[0];
    assert_eq!(
        incident.recipients.get(&RecipientKey::Contact(1)),
        Some(&ContactRole::Recipient),
        "alice keeps her role, mallory gets none"
    );
    // The event itself is persisted.
    assert!(
        h.db.events()
            .await
            .iter()
            .any(|e| e.event_type == EventType::AcknowledgementSet)
    );
}

#[tokio::test]
async fn roles_never_move_downward() {
    let mut h = harness(simple_tables()).await;

    h.engine
        .process_event(state_event(1, "h1", Severity::Crit, 100))
        .await
        .unwrap();
    h.engine
        .process_event(ack_event("h1", "alice", 110))
        .await
        .unwrap();

    // Another state change re-evaluates escalations; alice must stay
    // manager even though the escalation would enqueue her as a
    // recipient again.
    h.engine
        .process_event(state_event(1, "h1", Severity::Emerg, 120))
        .await
        .unwrap();

    let incident = &h.db.incidents().await[0];
    assert_eq!(
        incident.recipients.get(&RecipientKey::Contact(1)),
        Some(&ContactRole::Manager)
    );

    // Drain pending dispatches so the channel does not accumulate.
    while h.dispatch_rx.try_recv().is_ok() {}
}
