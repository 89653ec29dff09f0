use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type SourceId = i64;
pub type EventId = i64;
pub type IncidentId = i64;
pub type HistoryId = i64;
pub type RuleId = i64;

/// Severity scale for state events, ordered from `None` (not a state
/// event) over `Ok` up to `Emerg`. The derived `Ord` follows the
/// declaration order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Ok,
    Debug,
    Info,
    Notice,
    Warning,
    Err,
    Crit,
    Alert,
    Emerg,
}

impl Severity {
    /// True for severities that open or keep open an incident.
    pub fn is_problem(self) -> bool {
        self > Severity::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Ok => "ok",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Notice => "notice",
            Severity::Warning => "warning",
            Severity::Err => "err",
            Severity::Crit => "crit",
            Severity::Alert => "alert",
            Severity::Emerg => "emerg",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "none" => Ok(Severity::None),
            "ok" => Ok(Severity::Ok),
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "notice" => Ok(Severity::Notice),
            "warning" => Ok(Severity::Warning),
            "err" => Ok(Severity::Err),
            "crit" => Ok(Severity::Crit),
            "alert" => Ok(Severity::Alert),
            "emerg" => Ok(Severity::Emerg),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// What an event conveys about its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    State,
    AcknowledgementSet,
    AcknowledgementCleared,
    DowntimeStart,
    DowntimeEnd,
    DowntimeRemoved,
    FlappingStart,
    FlappingEnd,
    Mute,
    Unmute,
    Custom,
    Internal,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::State => "state",
            EventType::AcknowledgementSet => "acknowledgement-set",
            EventType::AcknowledgementCleared => "acknowledgement-cleared",
            EventType::DowntimeStart => "downtime-start",
            EventType::DowntimeEnd => "downtime-end",
            EventType::DowntimeRemoved => "downtime-removed",
            EventType::FlappingStart => "flapping-start",
            EventType::FlappingEnd => "flapping-end",
            EventType::Mute => "mute",
            EventType::Unmute => "unmute",
            EventType::Custom => "custom",
            EventType::Internal => "internal",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an object is muted. An object is muted iff its reason set is
/// non-empty.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MuteReason {
    Downtime,
    Flapping,
    Acknowledgement,
}

impl fmt::Display for MuteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MuteReason::Downtime => "downtime",
            MuteReason::Flapping => "flapping",
            MuteReason::Acknowledgement => "acknowledgement",
        };
        f.write_str(s)
    }
}

impl FromStr for MuteReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "downtime" => Ok(MuteReason::Downtime),
            "flapping" => Ok(MuteReason::Flapping),
            "acknowledgement" => Ok(MuteReason::Acknowledgement),
            other => Err(format!("unknown mute reason '{other}'")),
        }
    }
}

/// Role of a recipient on an incident. Transitions are monotonic
/// upward; `Manager` supersedes the others.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ContactRole {
    Recipient,
    Subscriber,
    Manager,
}

impl fmt::Display for ContactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContactRole::Recipient => "recipient",
            ContactRole::Subscriber => "subscriber",
            ContactRole::Manager => "manager",
        };
        f.write_str(s)
    }
}

/// Stable fingerprint of a monitored object: SHA-256 over the source id
/// and the id tags with keys in ascending byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub fn new(source_id: SourceId, tags: &BTreeMap<String, String>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_id.to_be_bytes());
        for (k, v) in tags {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", hex::encode(self.0))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("object id must be 32 bytes"))?;
        Ok(Self(arr))
    }
}
