use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::{DbError, Event, EventType, MuteReason, ObjectId, SourceId};
use crate::db::Database;

/// A monitored object: the entity events are correlated on.
///
/// Identity is `(source_id, tags)`; everything else is mutable metadata
/// updated from the latest event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub source_id: SourceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub mute_reasons: BTreeSet<MuteReason>,
}

impl Object {
    pub fn from_event(ev: &Event) -> Self {
        Self {
            id: ev.object_id(),
            source_id: ev.source_id,
            name: ev.name.clone(),
            url: ev.url.clone(),
            tags: ev.tags.clone(),
            extra_tags: ev.extra_tags.clone(),
            mute_reasons: BTreeSet::new(),
        }
    }

    /// An object is muted iff at least one mute reason is set.
    pub fn is_muted(&self) -> bool {
        !self.mute_reasons.is_empty()
    }
}

/// Outcome of applying a mute-conveying event to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuteChange {
    /// Mute state after the event.
    pub muted: bool,
    /// Whether the overall muted-ness flipped.
    pub changed: bool,
}

/// Canonical in-memory map of all objects seen during the process
/// lifetime. Objects are created on first reference and never dropped
/// from the cache.
pub struct ObjectRegistry {
    objects: Mutex<HashMap<ObjectId, Object>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up or creates the object for `ev` and refreshes its
    /// metadata from the event. Returns a snapshot; the caller persists
    /// it inside the ambient transaction.
    pub async fn resolve(&self, ev: &Event) -> Object {
        let id = ev.object_id();
        let mut objects = self.objects.lock().await;
        let obj = objects.entry(id).or_insert_with(|| {
            debug!(object = %id, name = %ev.name, "creating object");
            Object::from_event(ev)
        });
        obj.name = ev.name.clone();
        if ev.url.is_some() {
            obj.url = ev.url.clone();
        }
        if !ev.extra_tags.is_empty() {
            obj.extra_tags = ev.extra_tags.clone();
        }
        obj.clone()
    }

    /// Applies the mute transition `ev` conveys, if any. The object
    /// must already be resolved. Returns `None` for events without
    /// object-level mute semantics.
    pub async fn apply_mute(&self, ev: &Event) -> Option<MuteChange> {
        let mut objects = self.objects.lock().await;
        let obj = objects.get_mut(&ev.object_id())?;
        let was_muted = obj.is_muted();

        match (ev.event_type, ev.mute_reason) {
            // A bare unmute clears every reason at once; catch-up emits
            // these when the upstream no longer reports the object muted.
            (EventType::Unmute, None) => obj.mute_reasons.clear(),
            _ => match ev.mute_transition()? {
                (reason, true) => {
                    obj.mute_reasons.insert(reason);
                }
                (reason, false) => {
                    obj.mute_reasons.remove(&reason);
                }
            },
        }

        let muted = obj.is_muted();
        Some(MuteChange {
            muted,
            changed: muted != was_muted,
        })
    }

    /// Current snapshot of one object.
    pub async fn get(&self, id: &ObjectId) -> Option<Object> {
        self.objects.lock().await.get(id).cloned()
    }

    /// Whether the object is currently muted.
    pub async fn is_muted(&self, id: &ObjectId) -> bool {
        self.objects
            .lock()
            .await
            .get(id)
            .map(Object::is_muted)
            .unwrap_or(false)
    }

    /// Puts an object restored from the database into the cache,
    /// e.g. objects of reloaded open incidents.
    pub async fn insert(&self, obj: Object) {
        self.objects.lock().await.insert(obj.id, obj);
    }

    /// Reloads objects that are muted without an open incident so
    /// events arriving for them after a restart are not misclassified.
    pub async fn restore_muted(&self, db: &Arc<dyn Database>) -> Result<usize, DbError> {
        let restored = db.restore_muted_objects().await?;
        let count = restored.len();
        let mut objects = self.objects.lock().await;
        for obj in restored {
            objects.insert(obj.id, obj);
        }
        Ok(count)
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Severity;
    use chrono::Utc;

    fn event(ty: EventType, reason: Option<MuteReason>) -> Event {
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
            event_type: ty,
            severity: if ty == EventType::State {
                Severity::Crit
            } else {
                Severity::None
            },
            mute_reason: reason,
            username: None,
            message: None,
        }
    }

    #[tokio::test]
    async fn resolve_creates_once_and_updates_metadata() {
        let registry = ObjectRegistry::new();
        let ev = event(EventType::State, None);
        let a = registry.resolve(&ev).await;

        let mut ev2 = event(EventType::State, None);
        ev2.url = Some("https://example/host".to_string());
        let b = registry.resolve(&ev2).await;

        assert_eq!(a.id, b.id);
        assert_eq!(b.url.as_deref(), Some("https://example/host"));
    }

    #[tokio::test]
    async fn mute_reasons_accumulate_and_clear() {
        let registry = ObjectRegistry::new();
        let ev = event(EventType::State, None);
        registry.resolve(&ev).await;
        let id = ev.object_id();

        let change = registry
            .apply_mute(&event(EventType::DowntimeStart, None))
            .await
            .unwrap();
        assert!(change.muted && change.changed);

        let change = registry
            .apply_mute(&event(EventType::AcknowledgementSet, None))
            .await
            .unwrap();
        assert!(change.muted && !change.changed);

        let change = registry
            .apply_mute(&event(EventType::DowntimeEnd, None))
            .await
            .unwrap();
        assert!(change.muted && !change.changed, "ack still mutes");

        let change = registry
            .apply_mute(&event(EventType::AcknowledgementCleared, None))
            .await
            .unwrap();
        assert!(!change.muted && change.changed);
        assert!(!registry.is_muted(&id).await);
    }

    #[tokio::test]
    async fn bare_unmute_clears_all_reasons() {
        let registry = ObjectRegistry::new();
        let ev = event(EventType::State, None);
        registry.resolve(&ev).await;

        let _ = registry
            .apply_mute(&event(EventType::DowntimeStart, None))
            .await;
        let _ = registry
            .apply_mute(&event(EventType::FlappingStart, None))
            .await;
        assert!(registry.is_muted(&ev.object_id()).await);

        let change = registry
            .apply_mute(&event(EventType::Unmute, None))
            .await
            .unwrap();
        assert!(!change.muted && change.changed);
    }
}
