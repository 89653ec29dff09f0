//! Listener tests
//!
//! HTTP surface: event pushing with per-source credentials, status code
//! mapping and the protected diagnostic endpoints.
//! Run with: cargo test --test listener_tests

mod common;

use std::sync::Arc;

use common::*;
use incidentd::core::Severity;
use incidentd::db::SourceRow;
use incidentd::listener::Listener;
use tokio_util::sync::CancellationToken;

struct Server {
    url: String,
    token: CancellationToken,
    harness: Harness,
}

async fn start(mut tables: incidentd::db::RuntimeTables) -> Server {
    tables.sources.push(SourceRow {
        id: 1,
        name: "pushy".to_string(),
        kind: "generic".to_string(),
        base_url: None,
        auth_user: None,
        auth_pass: None,
        insecure_tls: false,
        listener_password: Some("sekrit".to_string()),
    });
    let harness = harness(tables).await;

    let listener = Listener {
        listen: "127.0.0.1:0".to_string(),
        debug_password: Some("debug-pw".to_string()),
        engine: Arc::clone(&harness.engine),
        runtime: Arc::clone(&harness.runtime),
    };
    let bound = listener.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let token = CancellationToken::new();
    tokio::spawn(bound.serve(token.clone()));

    Server {
        url: format!("http://{addr}"),
        token,
        harness,
    }
}

fn crit_body(host: &str) -> serde_json::Value {
    serde_json::json!({
        "name": host,
        "tags": { "host": host },
        "type": "state",
        "severity": "crit",
        "message": "it broke",
    })
}

#[tokio::test]
async fn pushed_event_opens_an_incident() {
    let server = start(simple_tables()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-1", Some("sekrit"))
        .json(&crit_body("h1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("event processed"));

    let incidents = server.harness.db.incidents().await;
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].severity, Severity::Crit);

    server.token.cancel();
}

#[tokio::test]
async fn wrong_credentials_are_rejected() {
    let server = start(simple_tables()).await;
    let client = reqwest::Client::new();

    // Wrong password.
    let response = client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-1", Some("wrong"))
        .json(&crit_body("h1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Unknown source.
    let response = client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-9", Some("sekrit"))
        .json(&crit_body("h1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // No credentials at all.
    let response = client
        .post(format!("{}/process-event", server.url))
        .json(&crit_body("h1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    assert!(server.harness.db.incidents().await.is_empty());
    server.token.cancel();
}

#[tokio::test]
async fn invalid_events_get_400() {
    let server = start(simple_tables()).await;
    let client = reqwest::Client::new();

    // No tags.
    let body = serde_json::json!({
        "name": "h1",
        "tags": {},
        "type": "state",
        "severity": "crit",
    });
    let response = client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-1", Some("sekrit"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Severity on a non-state event.
    let body = serde_json::json!({
        "name": "h1",
        "tags": { "host": "h1" },
        "type": "downtime-start",
        "severity": "crit",
    });
    let response = client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-1", Some("sekrit"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.token.cancel();
}

#[tokio::test]
async fn superfluous_and_unanchored_events_get_406() {
    let server = start(simple_tables()).await;
    let client = reqwest::Client::new();

    // OK without an open incident.
    let body = serde_json::json!({
        "name": "h1",
        "tags": { "host": "h1" },
        "type": "state",
        "severity": "ok",
    });
    let response = client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-1", Some("sekrit"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 406);

    // Acknowledgement without an open incident.
    let body = serde_json::json!({
        "name": "h1",
        "tags": { "host": "h1" },
        "type": "acknowledgement-set",
        "username": "alice",
    });
    let response = client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-1", Some("sekrit"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 406);

    server.token.cancel();
}

#[tokio::test]
async fn diagnostic_endpoints_require_the_debug_password() {
    let server = start(simple_tables()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/dump-incidents", server.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    client
        .post(format!("{}/process-event", server.url))
        .basic_auth("source-1", Some("sekrit"))
        .json(&crit_body("h1"))
        .send()
        .await
        .unwrap();

    let response = client
        .get(format!("{}/dump-incidents", server.url))
        .basic_auth("debug", Some("debug-pw"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let incidents: serde_json::Value = response.json().await.unwrap();
    assert_eq!(incidents.as_array().unwrap().len(), 1);
    assert_eq!(incidents[0]["severity"], "crit");

    let response = client
        .get(format!("{}/dump-config", server.url))
        .basic_auth("debug", Some("debug-pw"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let config: serde_json::Value = response.json().await.unwrap();
    assert_eq!(config["rules"][0]["name"], "everything");
    assert_eq!(config["sources"][0]["name"], "pushy");

    server.token.cancel();
}
