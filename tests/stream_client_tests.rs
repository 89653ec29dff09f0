//! Stream client tests
//!
//! End-to-end against a faked upstream API: subscription, catch-up
//! replay of current object states, and live event translation.
//! Run with: cargo test --test stream_client_tests

mod common;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::*;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use incidentd::core::Severity;
use incidentd::db::{RuntimeTables, SourceRow};
use incidentd::source::SourceClient;
use tokio_util::sync::CancellationToken;

type StreamSlot = Arc<StdMutex<Option<UnboundedReceiver<String>>>>;

async fn events(State(slot): State<StreamSlot>) -> Response {
    let rx = slot.lock().unwrap().take();
    match rx {
        Some(rx) => {
            let body = axum::body::Body::from_stream(
                rx.map(|line| Ok::<Vec<u8>, std::io::Error>(line.into_bytes())),
            );
            body.into_response()
        }
        None => (StatusCode::CONFLICT, "already subscribed").into_response(),
    }
}

async fn hosts() -> Response {
    axum::Json(serde_json::json!({
        "results": [
            {
                "name": "h1",
                "attrs": {
                    "state": 1,
                    "state_type": 1,
                    "last_state_change": 100.0,
                    "acknowledgement": 0,
                    "downtime_depth": 0,
                    "flapping": false
                }
            }
        ]
    }))
    .into_response()
}

async fn empty_results() -> Response {
    axum::Json(serde_json::json!({ "results": [] })).into_response()
}

async fn status() -> Response {
    axum::Json(serde_json::json!({
        "results": [
            { "status": { "icingaapplication": { "app": { "enable_flapping": true } } } }
        ]
    }))
    .into_response()
}

/// Starts the faked upstream; returns its address and the handle used
/// to push live stream lines.
async fn fake_upstream() -> (std::net::SocketAddr, UnboundedSender<String>) {
    let (tx, rx) = unbounded::<String>();
    let slot: StreamSlot = Arc::new(StdMutex::new(Some(rx)));

    let app = Router::new()
        .route("/v1/events", post(events))
        .route("/v1/objects/hosts", post(hosts))
        .route("/v1/objects/services", post(empty_results))
        .route("/v1/objects/comments", post(empty_results))
        .route("/v1/status/IcingaApplication/", get(status))
        .with_state(slot);

    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(tcp, app).await;
    });
    (addr, tx)
}

async fn wait_until<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn catch_up_replays_state_then_live_events_flow() {
    let h = harness(RuntimeTables::default()).await;
    let (addr, stream_tx) = fake_upstream().await;

    let source = Arc::new(SourceRow {
        id: 1,
        name: "icinga".to_string(),
        kind: "icinga2".to_string(),
        base_url: Some(format!("http://{addr}")),
        auth_user: Some("root".to_string()),
        auth_pass: Some("pw".to_string()),
        insecure_tls: false,
        listener_password: None,
    });
    let token = CancellationToken::new();
    let client = SourceClient::new(
        source,
        Arc::clone(&h.engine),
        Arc::clone(&h.registry),
        Duration::from_secs(5),
        None,
        token.clone(),
    )
    .unwrap();
    tokio::spawn(client.process());

    // Catch-up replays the down host as a crit state event stamped
    // with its last state change.
    let db = Arc::clone(&h.db);
    wait_until(
        || {
            let db = Arc::clone(&db);
            async move { db.incidents().await.len() == 1 }
        },
        "catch-up incident",
    )
    .await;

    let incident = &h.db.incidents().await[0];
    assert_eq!(incident.severity, Severity::Crit);
    assert_eq!(incident.started_at, ts(100));

    // A live hard state change for another object follows the stream.
    stream_tx
        .unbounded_send(
            concat!(
                r#"{"type":"StateChange","timestamp":200.0,"host":"h1","service":"disk","#,
                r#""state":2,"state_type":1,"check_result":{"output":"DISK CRITICAL"}}"#,
                "\n"
            )
            .to_string(),
        )
        .unwrap();

    let db = Arc::clone(&h.db);
    wait_until(
        || {
            let db = Arc::clone(&db);
            async move { db.incidents().await.len() == 2 }
        },
        "live incident",
    )
    .await;

    let mut incidents = h.db.incidents().await;
    incidents.sort_by_key(|i| i.started_at);
    assert_eq!(incidents[1].started_at, ts(200));
    let events = h.db.events().await;
    assert!(
        events
            .iter()
            .any(|e| e.name == "h1!disk" && e.severity == Severity::Crit)
    );

    // Soft state changes are dropped before they reach the engine.
    stream_tx
        .unbounded_send(
            r#"{"type":"StateChange","timestamp":210.0,"host":"h3","state":1,"state_type":0}"#
                .to_string()
                + "\n",
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.db.incidents().await.len(), 2);

    token.cancel();
}

#[tokio::test]
async fn cancelling_the_client_stops_processing() {
    let h = harness(RuntimeTables::default()).await;
    let (addr, _stream_tx) = fake_upstream().await;

    let source = Arc::new(SourceRow {
        id: 1,
        name: "icinga".to_string(),
        kind: "icinga2".to_string(),
        base_url: Some(format!("http://{addr}")),
        auth_user: Some("root".to_string()),
        auth_pass: Some("pw".to_string()),
        insecure_tls: false,
        listener_password: None,
    });
    let token = CancellationToken::new();
    let client = SourceClient::new(
        source,
        Arc::clone(&h.engine),
        Arc::clone(&h.registry),
        Duration::from_secs(5),
        None,
        token.clone(),
    )
    .unwrap();
    let task = tokio::spawn(client.process());

    let db = Arc::clone(&h.db);
    wait_until(
        || {
            let db = Arc::clone(&db);
            async move { db.incidents().await.len() == 1 }
        },
        "catch-up incident",
    )
    .await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("client exits on cancellation")
        .unwrap();
}
