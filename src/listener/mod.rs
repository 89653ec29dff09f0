//! Push listener.
//!
//! HTTP surface accepting directly pushed events from generic sources,
//! plus password-protected diagnostic dumps. Sources authenticate with
//! basic auth `source-<id>:<listener password>`; secrets are compared
//! through SHA-256 digests so the comparison takes constant time.
//!
//! Connections are driven through hyper directly so all three timeout
//! tiers apply: reading and answering one request is bounded by the
//! request deadline, while a keep-alive connection waiting for its
//! next request is closed by the idle timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use chrono::Utc;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::{Event, EventType, MuteReason, ProcessError, Severity, SourceId};
use crate::incident::IncidentEngine;
use crate::runtime::RuntimeCache;

/// Read/write budget for one request: from parsed headers to the last
/// response byte.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a connection may sit idle waiting for request headers,
/// both on a fresh connection and between keep-alive requests.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for draining in-flight handlers on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Listener {
    pub listen: String,
    pub debug_password: Option<String>,
    pub engine: Arc<IncidentEngine>,
    pub runtime: Arc<RuntimeCache>,
}

struct ListenerState {
    debug_password: Option<String>,
    engine: Arc<IncidentEngine>,
    runtime: Arc<RuntimeCache>,
}

impl Listener {
    /// Binds the listen socket. Split from [`BoundListener::serve`] so
    /// bind errors surface at bootstrap and tests can bind port 0.
    pub async fn bind(self) -> std::io::Result<BoundListener> {
        let state = Arc::new(ListenerState {
            debug_password: self.debug_password,
            engine: self.engine,
            runtime: self.runtime,
        });

        let app = Router::new()
            .route("/process-event", post(process_event))
            .route("/dump-config", get(dump_config))
            .route("/dump-incidents", get(dump_incidents))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let tcp = tokio::net::TcpListener::bind(&self.listen).await?;
        info!(listen = %tcp.local_addr()?, "listener accepting events");
        Ok(BoundListener { tcp, app })
    }

    pub async fn run(self, token: CancellationToken) -> std::io::Result<()> {
        self.bind().await?.serve(token).await
    }
}

pub struct BoundListener {
    tcp: tokio::net::TcpListener,
    app: Router,
}

impl BoundListener {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp.local_addr()
    }

    /// Serves until cancellation: stops accepting, then drains
    /// in-flight connections within the shutdown budget.
    pub async fn serve(self, token: CancellationToken) -> std::io::Result<()> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.tcp.accept() => {
                    let (stream, _peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(%err, "cannot accept connection");
                            continue;
                        }
                    };
                    let app = self.app.clone();
                    let conn_token = token.clone();
                    tracker.spawn(serve_connection(stream, app, conn_token));
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded, dropping in-flight requests");
        }
        Ok(())
    }
}

/// Runs one connection to completion. The idle timeout closes the
/// connection while it waits for request headers; the per-request
/// deadline is enforced by the router's timeout layer.
async fn serve_connection(
    stream: tokio::net::TcpStream,
    app: Router,
    token: CancellationToken,
) {
    let service = service_fn(move |request: Request<Incoming>| {
        app.clone().oneshot(request.map(Body::new))
    });
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(IDLE_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(%err, "connection closed");
            }
        }
        _ = token.cancelled() => {
            // Finish the in-flight response, accept nothing further.
            conn.as_mut().graceful_shutdown();
            let _ = conn.await;
        }
    }
}

/// Wire form of a pushed event. `time` is always assigned by the
/// listener; the source id comes from authentication.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessEventRequest {
    name: String,
    #[serde(default)]
    url: Option<String>,
    tags: BTreeMap<String, String>,
    #[serde(default)]
    extra_tags: BTreeMap<String, String>,
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    mute_reason: Option<MuteReason>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

async fn process_event(
    State(state): State<Arc<ListenerState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(source_id) = authenticate_source(&state, &headers).await else {
        return unauthorized();
    };

    let request: ProcessEventRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid event: {err}\n")).into_response();
        }
    };

    let event = Event {
        id: None,
        time: Utc::now(),
        source_id,
        name: request.name,
        url: request.url,
        tags: request.tags,
        extra_tags: request.extra_tags,
        event_type: request.event_type,
        severity: request.severity,
        mute_reason: request.mute_reason,
        username: request.username,
        message: request.message,
    };

    match state.engine.process_event(event).await {
        Ok(()) => (StatusCode::OK, "event processed successfully\n").into_response(),
        Err(err @ (ProcessError::SuperfluousStateChange | ProcessError::NoOpenIncident)) => {
            (StatusCode::NOT_ACCEPTABLE, format!("{err}\n")).into_response()
        }
        Err(ProcessError::Validation(err)) => {
            (StatusCode::BAD_REQUEST, format!("{err}\n")).into_response()
        }
        Err(err) => {
            warn!(%err, "cannot process pushed event");
            (StatusCode::INTERNAL_SERVER_ERROR, "cannot process event\n").into_response()
        }
    }
}

async fn dump_config(
    State(state): State<Arc<ListenerState>>,
    headers: HeaderMap,
) -> Response {
    if !authenticate_debug(&state, &headers) {
        return unauthorized();
    }
    let cfg = state.runtime.read().await;

    let rules: Vec<serde_json::Value> = cfg
        .rules()
        .map(|rule| {
            serde_json::json!({
                "id": rule.id,
                "name": rule.name,
                "object_filter": rule.object_filter.to_string(),
                "timeperiod": rule.timeperiod.as_ref().map(|tp| tp.name.clone()),
                "escalations": rule.escalations.iter().map(|esc| serde_json::json!({
                    "id": esc.id,
                    "name": esc.name,
                    "condition": esc.condition.to_string(),
                    "recipients": esc.recipients.iter().map(|r| serde_json::json!({
                        "recipient": r.recipient.key().to_string(),
                        "channel": r.channel,
                    })).collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    let contacts: Vec<serde_json::Value> = cfg
        .contacts()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "full_name": c.full_name,
                "username": c.username,
                "default_channel": c.default_channel,
            })
        })
        .collect();
    let channels: Vec<&str> = cfg.channels().map(|c| c.channel_type.as_str()).collect();
    let sources: Vec<serde_json::Value> = cfg
        .sources()
        .values()
        .map(|s| serde_json::json!({ "id": s.id, "name": s.name, "kind": s.kind }))
        .collect();

    Json(serde_json::json!({
        "rules": rules,
        "contacts": contacts,
        "channels": channels,
        "sources": sources,
    }))
    .into_response()
}

async fn dump_incidents(
    State(state): State<Arc<ListenerState>>,
    headers: HeaderMap,
) -> Response {
    if !authenticate_debug(&state, &headers) {
        return unauthorized();
    }
    Json(state.engine.dump().await).into_response()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"incidentd\"")],
        "authentication required\n",
    )
        .into_response()
}

/// Extracts `(user, password)` from a basic auth header.
fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Resolves `source-<id>` credentials against the runtime config.
async fn authenticate_source(state: &ListenerState, headers: &HeaderMap) -> Option<SourceId> {
    let (user, password) = basic_auth(headers)?;
    let id: SourceId = user.strip_prefix("source-")?.parse().ok()?;
    let cfg = state.runtime.read().await;
    let source = cfg.source(id)?;
    let expected = source.listener_password.as_deref()?;
    constant_time_eq(expected, &password).then_some(id)
}

fn authenticate_debug(state: &ListenerState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.debug_password.as_deref() else {
        return false;
    };
    let Some((_, password)) = basic_auth(headers) else {
        return false;
    };
    constant_time_eq(expected, &password)
}

/// Compares SHA-256 digests instead of the raw strings, keeping the
/// comparison independent of where the secrets diverge.
fn constant_time_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}
