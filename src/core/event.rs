use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventId, EventType, MuteReason, ObjectId, Severity, SourceId, ValidationError};

/// A single monitoring event, immutable after validation.
///
/// `id` is unset until the event has been written to the event table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,

    pub time: DateTime<Utc>,
    pub source_id: SourceId,

    /// Human-readable object name, e.g. `web1!disk`.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Identity tags. Together with `source_id` they determine the
    /// object this event belongs to.
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_tags: BTreeMap<String, String>,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_reason: Option<MuteReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    /// Fingerprint of the object this event addresses.
    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(self.source_id, &self.tags)
    }

    /// Checks the structural invariants every event must satisfy before
    /// it may enter the incident engine.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_id == 0 {
            return Err(ValidationError("source id must not be zero".into()));
        }
        if self.tags.is_empty() {
            return Err(ValidationError("event requires at least one tag".into()));
        }
        if self.tags.keys().any(|k| k.is_empty()) {
            return Err(ValidationError("tag keys must not be empty".into()));
        }
        match self.event_type {
            EventType::State => {
                if self.severity == Severity::None {
                    return Err(ValidationError(
                        "state event requires a severity".into(),
                    ));
                }
            }
            _ => {
                if self.severity != Severity::None {
                    return Err(ValidationError(format!(
                        "severity must only be set on state events, not '{}'",
                        self.event_type
                    )));
                }
            }
        }
        if self.event_type == EventType::Mute && self.mute_reason.is_none() {
            return Err(ValidationError("mute event requires a reason".into()));
        }
        Ok(())
    }

    /// True if this event changes object-level mute state and therefore
    /// must be persisted even without an open incident.
    pub fn conveys_mute_state(&self) -> bool {
        matches!(
            self.event_type,
            EventType::Mute
                | EventType::Unmute
                | EventType::DowntimeStart
                | EventType::DowntimeEnd
                | EventType::DowntimeRemoved
                | EventType::FlappingStart
                | EventType::FlappingEnd
                | EventType::AcknowledgementSet
                | EventType::AcknowledgementCleared
        )
    }

    /// The mute reason this event adds or removes, if any, together
    /// with whether it mutes (true) or unmutes (false).
    pub fn mute_transition(&self) -> Option<(MuteReason, bool)> {
        match self.event_type {
            EventType::DowntimeStart => Some((MuteReason::Downtime, true)),
            EventType::DowntimeEnd | EventType::DowntimeRemoved => {
                Some((MuteReason::Downtime, false))
            }
            EventType::FlappingStart => Some((MuteReason::Flapping, true)),
            EventType::FlappingEnd => Some((MuteReason::Flapping, false)),
            EventType::AcknowledgementSet => Some((MuteReason::Acknowledgement, true)),
            EventType::AcknowledgementCleared => Some((MuteReason::Acknowledgement, false)),
            EventType::Mute => self.mute_reason.map(|r| (r, true)),
            EventType::Unmute => self.mute_reason.map(|r| (r, false)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event() -> Event {
        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), "web1".to_string());
        Event {
            id: None,
            time: Utc::now(),
            source_id: 1,
            name: "web1".to_string(),
            url: None,
            tags,
            extra_tags: BTreeMap::new(),
            event_type: EventType::State,
            severity: Severity::Crit,
            mute_reason: None,
            username: None,
            message: None,
        }
    }

    #[test]
    fn valid_state_event_passes() {
        assert!(base_event().validate().is_ok());
    }

    #[test]
    fn state_event_without_severity_is_rejected() {
        let mut ev = base_event();
        ev.severity = Severity::None;
        assert!(ev.validate().is_err());
    }

    #[test]
    fn severity_on_non_state_event_is_rejected() {
        let mut ev = base_event();
        ev.event_type = EventType::AcknowledgementSet;
        assert!(ev.validate().is_err());
    }

    #[test]
    fn empty_tags_are_rejected() {
        let mut ev = base_event();
        ev.tags.clear();
        assert!(ev.validate().is_err());
    }

    #[test]
    fn zero_source_is_rejected() {
        let mut ev = base_event();
        ev.source_id = 0;
        assert!(ev.validate().is_err());
    }

    #[test]
    fn mute_event_requires_reason() {
        let mut ev = base_event();
        ev.event_type = EventType::Mute;
        ev.severity = Severity::None;
        assert!(ev.validate().is_err());

        ev.mute_reason = Some(MuteReason::Downtime);
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn downtime_start_mutes_and_end_unmutes() {
        let mut ev = base_event();
        ev.severity = Severity::None;
        ev.event_type = EventType::DowntimeStart;
        assert_eq!(ev.mute_transition(), Some((MuteReason::Downtime, true)));
        ev.event_type = EventType::DowntimeRemoved;
        assert_eq!(ev.mute_transition(), Some((MuteReason::Downtime, false)));
    }
}
