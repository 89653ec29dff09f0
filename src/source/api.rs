//! Icinga 2 API client and wire types.
//!
//! Timestamps on this surface are floating-point seconds since the UNIX
//! epoch, parsed to microsecond precision. States and similar fields
//! are numeric enumerations: host state 0=up 1=down; service state 0=ok
//! 1=warning 2=critical 3=unknown; state type 0=soft 1=hard;
//! acknowledgement 0=none 1=normal 2=sticky; comment entry type 1=user
//! 2=downtime 3=flapping 4=acknowledgement.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, Url, header};
use serde::Deserialize;
use thiserror::Error;

use crate::core::{Event, EventType, MuteReason, Severity, SourceId};
use crate::db::SourceRow;

/// Connect budget per attempt; the rest of the request runs under the
/// configured API timeout (streams run unbounded).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Event stream types the client subscribes to.
pub const SUBSCRIBED_TYPES: &[&str] = &[
    "StateChange",
    "AcknowledgementSet",
    "AcknowledgementCleared",
    "DowntimeStarted",
    "DowntimeTriggered",
    "DowntimeRemoved",
    "Flapping",
];

const STATE_TYPE_HARD: i64 = 1;
const ACKNOWLEDGEMENT_NONE: i64 = 0;
const COMMENT_ENTRY_ACKNOWLEDGEMENT: i64 = 4;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("bad payload: {0}")]
    Decode(String),
}

/// Parses a floating-point UNIX timestamp to microsecond precision.
pub fn from_unix_seconds(ts: f64) -> Option<DateTime<Utc>> {
    let micros = (ts * 1_000_000.0).round();
    if !micros.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

mod unix_ts {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(d)?;
        from_unix_seconds(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("bad timestamp {secs}")))
    }
}

/// Severity of a host state.
pub fn host_severity(state: i64) -> Severity {
    if state == 0 { Severity::Ok } else { Severity::Crit }
}

/// Severity of a service state; unknown maps to err.
pub fn service_severity(state: i64) -> Severity {
    match state {
        0 => Severity::Ok,
        1 => Severity::Warning,
        2 => Severity::Crit,
        _ => Severity::Err,
    }
}

// --- event stream ---------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamMessage {
    StateChange(StateChange),
    AcknowledgementSet(AcknowledgementSet),
    AcknowledgementCleared(AcknowledgementCleared),
    DowntimeStarted(DowntimeMessage),
    DowntimeTriggered(DowntimeMessage),
    DowntimeRemoved(DowntimeMessage),
    Flapping(Flapping),
}

// Numeric fields on this surface may arrive as `2` or `2.0`; they are
// declared as f64 and narrowed at the use site.
#[derive(Debug, Deserialize)]
pub struct StateChange {
    #[serde(with = "unix_ts")]
    pub timestamp: DateTime<Utc>,
    pub host: String,
    #[serde(default)]
    pub service: Option<String>,
    pub state: f64,
    pub state_type: f64,
    #[serde(default)]
    pub check_result: Option<CheckResult>,
}

#[derive(Debug, Deserialize)]
pub struct CheckResult {
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgementSet {
    #[serde(with = "unix_ts")]
    pub timestamp: DateTime<Utc>,
    pub host: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub acknowledgement_type: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgementCleared {
    #[serde(with = "unix_ts")]
    pub timestamp: DateTime<Utc>,
    pub host: String,
    #[serde(default)]
    pub service: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DowntimeMessage {
    #[serde(with = "unix_ts")]
    pub timestamp: DateTime<Utc>,
    pub downtime: Downtime,
}

#[derive(Debug, Deserialize)]
pub struct Downtime {
    pub host_name: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Flapping {
    #[serde(with = "unix_ts")]
    pub timestamp: DateTime<Utc>,
    pub host: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub is_flapping: bool,
}

// --- object listing -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Hosts,
    Services,
}

impl ObjectKind {
    fn path(self) -> &'static str {
        match self {
            ObjectKind::Hosts => "v1/objects/hosts",
            ObjectKind::Services => "v1/objects/services",
        }
    }

    fn attrs(self) -> &'static [&'static str] {
        match self {
            ObjectKind::Hosts => &[
                "name",
                "state",
                "state_type",
                "last_state_change",
                "acknowledgement",
                "acknowledgement_last_change",
                "downtime_depth",
                "flapping",
            ],
            ObjectKind::Services => &[
                "name",
                "host_name",
                "state",
                "state_type",
                "last_state_change",
                "acknowledgement",
                "acknowledgement_last_change",
                "downtime_depth",
                "flapping",
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct ApiObject {
    /// `host` or `host!service`.
    pub name: String,
    pub attrs: ObjectAttrs,
}

#[derive(Debug, Deserialize)]
pub struct ObjectAttrs {
    #[serde(default)]
    pub host_name: Option<String>,
    pub state: f64,
    pub state_type: f64,
    #[serde(with = "unix_ts")]
    pub last_state_change: DateTime<Utc>,
    #[serde(default)]
    pub acknowledgement: f64,
    #[serde(default)]
    pub acknowledgement_last_change: Option<f64>,
    #[serde(default)]
    pub downtime_depth: f64,
    #[serde(default)]
    pub flapping: bool,
}

impl ApiObject {
    /// Host name and optional service name of this object.
    pub fn names(&self) -> (String, Option<String>) {
        match &self.attrs.host_name {
            Some(host) => {
                let service = self
                    .name
                    .split_once('!')
                    .map(|(_, s)| s.to_string())
                    .unwrap_or_else(|| self.name.clone());
                (host.clone(), Some(service))
            }
            None => (self.name.clone(), None),
        }
    }

    pub fn is_hard_state(&self) -> bool {
        self.attrs.state_type as i64 == STATE_TYPE_HARD
    }

    pub fn is_acknowledged(&self) -> bool {
        self.attrs.acknowledgement as i64 != ACKNOWLEDGEMENT_NONE
    }

    pub fn in_downtime(&self) -> bool {
        self.attrs.downtime_depth as i64 > 0
    }
}

#[derive(Debug, Deserialize)]
struct CommentObject {
    attrs: CommentAttrs,
}

#[derive(Debug, Deserialize)]
struct CommentAttrs {
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(with = "unix_ts")]
    entry_time: DateTime<Utc>,
    entry_type: f64,
}

/// Author and text of an acknowledgement comment.
#[derive(Debug, Clone)]
pub struct AckComment {
    pub author: Option<String>,
    pub text: Option<String>,
    pub entry_time: DateTime<Utc>,
}

// --- client ---------------------------------------------------------------

pub struct IcingaClient {
    http: reqwest::Client,
    base_url: String,
    auth_user: String,
    auth_pass: String,
    api_timeout: Duration,
}

impl IcingaClient {
    pub fn new(source: &SourceRow, api_timeout: Duration) -> Result<Self, ApiError> {
        let base_url = source
            .base_url
            .clone()
            .ok_or_else(|| ApiError::Decode("source has no base URL".into()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(source.insecure_tls)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_user: source.auth_user.clone().unwrap_or_default(),
            auth_pass: source.auth_pass.clone().unwrap_or_default(),
            api_timeout,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, path))
            .basic_auth(&self.auth_user, Some(&self.auth_pass))
            .header(header::ACCEPT, "application/json")
    }

    /// Subscribes to the event stream under `queue`. The returned
    /// response body is a chunked stream of newline-delimited JSON.
    pub async fn subscribe(&self, queue: &str) -> Result<reqwest::Response, ApiError> {
        let body = serde_json::json!({
            "queue": queue,
            "types": SUBSCRIBED_TYPES,
        });
        let response = self
            .request(Method::POST, "v1/events")
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }
        Ok(response)
    }

    /// Lists host or service objects with the attributes catch-up needs.
    pub async fn query_objects(&self, kind: ObjectKind) -> Result<Vec<ApiObject>, ApiError> {
        let body = serde_json::json!({ "attrs": kind.attrs() });
        let response = self
            .request(Method::POST, kind.path())
            .header("X-Http-Method-Override", "GET")
            .timeout(self.api_timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }
        let envelope: ResultsEnvelope<ApiObject> = response.json().await?;
        Ok(envelope.results)
    }

    /// Finds the acknowledgement comment nearest in time to `around`,
    /// within a one second tolerance.
    pub async fn find_ack_comment(
        &self,
        host: &str,
        service: Option<&str>,
        around: DateTime<Utc>,
    ) -> Result<Option<AckComment>, ApiError> {
        let (filter, filter_vars) = match service {
            Some(service) => (
                "comment.entry_type==entry && comment.host_name==host && comment.service_name==service",
                serde_json::json!({
                    "entry": COMMENT_ENTRY_ACKNOWLEDGEMENT,
                    "host": host,
                    "service": service,
                }),
            ),
            None => (
                "comment.entry_type==entry && comment.host_name==host && comment.service_name==\"\"",
                serde_json::json!({
                    "entry": COMMENT_ENTRY_ACKNOWLEDGEMENT,
                    "host": host,
                }),
            ),
        };
        let body = serde_json::json!({
            "filter": filter,
            "filter_vars": filter_vars,
            "attrs": ["author", "text", "entry_time", "entry_type"],
        });
        let response = self
            .request(Method::POST, "v1/objects/comments")
            .header("X-Http-Method-Override", "GET")
            .timeout(self.api_timeout)
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }
        let envelope: ResultsEnvelope<CommentObject> = response.json().await?;

        let tolerance = chrono::Duration::seconds(1);
        let best = envelope
            .results
            .into_iter()
            .filter(|c| c.attrs.entry_type as i64 == COMMENT_ENTRY_ACKNOWLEDGEMENT)
            .map(|c| {
                let distance = (c.attrs.entry_time - around).abs();
                (distance, c)
            })
            .filter(|(distance, _)| *distance <= tolerance)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, c)| AckComment {
                author: c.attrs.author,
                text: c.attrs.text,
                entry_time: c.attrs.entry_time,
            });
        Ok(best)
    }

    /// Whether flapping detection is globally enabled.
    pub async fn flapping_enabled(&self) -> Result<bool, ApiError> {
        let response = self
            .request(Method::GET, "v1/status/IcingaApplication/")
            .timeout(self.api_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }
        let value: serde_json::Value = response.json().await?;
        value
            .pointer("/results/0/status/icingaapplication/app/enable_flapping")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| ApiError::Decode("missing enable_flapping in status".into()))
    }
}

// --- translation ----------------------------------------------------------

/// Everything needed to turn upstream payloads into canonical events.
#[derive(Debug, Clone)]
pub struct TranslateContext {
    pub source_id: SourceId,
    pub icingaweb2_url: Option<String>,
}

impl TranslateContext {
    pub fn object_name(&self, host: &str, service: Option<&str>) -> String {
        match service {
            Some(service) => format!("{host}!{service}"),
            None => host.to_string(),
        }
    }

    pub fn tags(&self, host: &str, service: Option<&str>) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), host.to_string());
        if let Some(service) = service {
            tags.insert("service".to_string(), service.to_string());
        }
        tags
    }

    /// Deep link into the web frontend for this object.
    pub fn object_url(&self, host: &str, service: Option<&str>) -> Option<String> {
        let base = self.icingaweb2_url.as_deref()?.trim_end_matches('/');
        let url = match service {
            Some(service) => Url::parse_with_params(
                &format!("{base}/icingadb/service"),
                &[("name", service), ("host.name", host)],
            ),
            None => Url::parse_with_params(&format!("{base}/icingadb/host"), &[("name", host)]),
        };
        url.ok().map(|u| u.to_string())
    }

    /// Skeleton event for one object; callers fill type, severity and
    /// the remaining fields.
    pub fn event(&self, host: &str, service: Option<&str>, time: DateTime<Utc>) -> Event {
        Event {
            id: None,
            time,
            source_id: self.source_id,
            name: self.object_name(host, service),
            url: self.object_url(host, service),
            tags: self.tags(host, service),
            extra_tags: BTreeMap::new(),
            event_type: EventType::State,
            severity: Severity::None,
            mute_reason: None,
            username: None,
            message: None,
        }
    }
}

/// Translates one stream message into a canonical event, or `None` for
/// transitions that are represented by another message:
///
/// - soft state changes,
/// - `DowntimeTriggered` of fixed downtimes (`DowntimeStarted` is the
///   transition),
/// - `DowntimeStarted` of flexible downtimes (`DowntimeTriggered` is
///   the transition).
pub fn translate(msg: StreamMessage, ctx: &TranslateContext) -> Option<Event> {
    match msg {
        StreamMessage::StateChange(sc) => {
            if sc.state_type as i64 != STATE_TYPE_HARD {
                return None;
            }
            let mut ev = ctx.event(&sc.host, sc.service.as_deref(), sc.timestamp);
            ev.event_type = EventType::State;
            ev.severity = match sc.service {
                Some(_) => service_severity(sc.state as i64),
                None => host_severity(sc.state as i64),
            };
            ev.message = sc.check_result.and_then(|cr| cr.output);
            Some(ev)
        }
        StreamMessage::AcknowledgementSet(ack) => {
            let mut ev = ctx.event(&ack.host, ack.service.as_deref(), ack.timestamp);
            ev.event_type = EventType::AcknowledgementSet;
            ev.username = ack.author;
            ev.message = ack.comment;
            Some(ev)
        }
        StreamMessage::AcknowledgementCleared(ack) => {
            let mut ev = ctx.event(&ack.host, ack.service.as_deref(), ack.timestamp);
            ev.event_type = EventType::AcknowledgementCleared;
            Some(ev)
        }
        StreamMessage::DowntimeStarted(msg) => {
            if !msg.downtime.fixed {
                return None;
            }
            Some(downtime_event(EventType::DowntimeStart, msg, ctx))
        }
        StreamMessage::DowntimeTriggered(msg) => {
            if msg.downtime.fixed {
                return None;
            }
            Some(downtime_event(EventType::DowntimeStart, msg, ctx))
        }
        StreamMessage::DowntimeRemoved(msg) => {
            Some(downtime_event(EventType::DowntimeRemoved, msg, ctx))
        }
        StreamMessage::Flapping(flapping) => {
            let mut ev = ctx.event(&flapping.host, flapping.service.as_deref(), flapping.timestamp);
            ev.event_type = if flapping.is_flapping {
                EventType::FlappingStart
            } else {
                EventType::FlappingEnd
            };
            Some(ev)
        }
    }
}

fn downtime_event(event_type: EventType, msg: DowntimeMessage, ctx: &TranslateContext) -> Event {
    let mut ev = ctx.event(
        &msg.downtime.host_name,
        msg.downtime.service_name.as_deref(),
        msg.timestamp,
    );
    ev.event_type = event_type;
    if event_type == EventType::DowntimeStart {
        ev.mute_reason = Some(MuteReason::Downtime);
    }
    ev.username = msg.downtime.author;
    ev.message = msg.downtime.comment;
    ev
}
