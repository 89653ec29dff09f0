//! Catch-up phase.
//!
//! After every (re-)connect the client reconciles state missed while
//! disconnected: it lists all host and service objects and synthesizes
//! up to three events per object, time-stamped with the object's last
//! state change, so the incident engine sees the transitions it missed.
//! Duplicate suppression happens downstream: processing an unchanged
//! state is rejected as superfluous by the engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::{
    ApiError, ApiObject, IcingaClient, ObjectKind, TranslateContext, from_unix_seconds,
    host_severity, service_severity,
};
use crate::core::{Event, EventType, MuteReason, ObjectId};
use crate::object::ObjectRegistry;

/// A synthesized replay event. `api_time` feeds the dispatcher's replay
/// cache used to drop stale buffered live events.
#[derive(Debug, Clone)]
pub struct CatchupEvent {
    pub event: Event,
    pub api_time: DateTime<Utc>,
}

/// Produces the replay stream into `tx`. Closing the channel signals
/// completion; an `Err` item signals a failed catch-up the dispatcher
/// retries with backoff.
pub(super) async fn run_catchup(
    api: Arc<IcingaClient>,
    ctx: TranslateContext,
    registry: Arc<ObjectRegistry>,
    tx: mpsc::Sender<Result<CatchupEvent, ApiError>>,
    token: CancellationToken,
) {
    if let Err(err) = produce(&api, &ctx, &registry, &tx, &token).await {
        let _ = tx.send(Err(err)).await;
    }
}

async fn produce(
    api: &IcingaClient,
    ctx: &TranslateContext,
    registry: &ObjectRegistry,
    tx: &mpsc::Sender<Result<CatchupEvent, ApiError>>,
    token: &CancellationToken,
) -> Result<(), ApiError> {
    let flapping_enabled = api.flapping_enabled().await?;

    let (hosts, services) = tokio::try_join!(
        api.query_objects(ObjectKind::Hosts),
        api.query_objects(ObjectKind::Services),
    )?;
    debug!(
        hosts = hosts.len(),
        services = services.len(),
        "replaying current object states"
    );

    for obj in hosts.into_iter().chain(services) {
        if token.is_cancelled() {
            return Ok(());
        }
        for ev in synthesize(api, ctx, registry, &obj, flapping_enabled).await {
            if tx.send(Ok(ev)).await.is_err() {
                // The dispatcher replaced this catch-up; drain silently.
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Synthesizes the replay events for one object: its current hard
/// state, a mute (plus acknowledgement) if it is muted upstream, or an
/// unmute if the registry believes it muted but upstream does not.
async fn synthesize(
    api: &IcingaClient,
    ctx: &TranslateContext,
    registry: &ObjectRegistry,
    obj: &ApiObject,
    flapping_enabled: bool,
) -> Vec<CatchupEvent> {
    let (host, service) = obj.names();
    let service = service.as_deref();
    let time = obj.attrs.last_state_change;
    let mut events = Vec::new();

    // Soft states are skipped; the last hard transition already
    // happened and anything newer is not final yet.
    if obj.is_hard_state() {
        let mut ev = ctx.event(&host, service, time);
        ev.event_type = EventType::State;
        ev.severity = match service {
            Some(_) => service_severity(obj.attrs.state as i64),
            None => host_severity(obj.attrs.state as i64),
        };
        events.push(CatchupEvent {
            event: ev,
            api_time: time,
        });
    }

    let flapping = obj.attrs.flapping && flapping_enabled;
    if obj.in_downtime() || flapping || obj.is_acknowledged() {
        if obj.in_downtime() || flapping {
            let mut ev = ctx.event(&host, service, time);
            ev.event_type = EventType::Mute;
            ev.mute_reason = Some(if obj.in_downtime() {
                MuteReason::Downtime
            } else {
                MuteReason::Flapping
            });
            events.push(CatchupEvent {
                event: ev,
                api_time: time,
            });
        }
        if obj.is_acknowledged() {
            let ack_time = obj
                .attrs
                .acknowledgement_last_change
                .and_then(from_unix_seconds)
                .unwrap_or(time);
            let comment = match api.find_ack_comment(&host, service, ack_time).await {
                Ok(comment) => comment,
                Err(err) => {
                    warn!(object = %ctx.object_name(&host, service), %err,
                        "cannot locate acknowledgement comment");
                    None
                }
            };
            let mut ev = ctx.event(&host, service, ack_time);
            ev.event_type = EventType::AcknowledgementSet;
            if let Some(comment) = comment {
                ev.username = comment.author;
                ev.message = comment.text;
            }
            events.push(CatchupEvent {
                event: ev,
                api_time: ack_time,
            });
        }
    } else {
        let object_id = ObjectId::new(ctx.source_id, &ctx.tags(&host, service));
        if registry.is_muted(&object_id).await {
            let mut ev = ctx.event(&host, service, time);
            ev.event_type = EventType::Unmute;
            events.push(CatchupEvent {
                event: ev,
                api_time: time,
            });
        }
    }

    events
}
