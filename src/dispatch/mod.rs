//! Notification dispatcher.
//!
//! Consumes dispatch descriptors the incident engine hands over after
//! commit, invokes the channel plugin and records the delivery outcome
//! on the pending `notified` row. Runs outside the incident lock and
//! outside the event transaction; a failed send is logged and recorded,
//! never retried automatically.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db::{Database, NotifiedState};
use crate::incident::DispatchDescriptor;
use crate::plugin::{ContactPayload, NotificationRequest, PluginRegistry};
use crate::runtime::RuntimeCache;

pub struct NotificationDispatcher {
    db: Arc<dyn Database>,
    plugins: Arc<PluginRegistry>,
    runtime: Arc<RuntimeCache>,
    icingaweb2_url: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        plugins: Arc<PluginRegistry>,
        runtime: Arc<RuntimeCache>,
        icingaweb2_url: Option<String>,
    ) -> Self {
        Self {
            db,
            plugins,
            runtime,
            icingaweb2_url,
        }
    }

    /// Dispatcher loop; one task per process. Exits when the engine
    /// side closes the queue or on cancellation.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<DispatchDescriptor>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("notification dispatcher stopped");
                    return;
                }
                descriptor = rx.recv() => {
                    match descriptor {
                        Some(descriptor) => self.deliver(descriptor).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn deliver(&self, descriptor: DispatchDescriptor) {
        let channel_config = self
            .runtime
            .read()
            .await
            .channel(&descriptor.channel)
            .map(|c| c.config.clone())
            .unwrap_or(serde_json::Value::Null);

        let incident_url = self.icingaweb2_url.as_ref().map(|base| {
            format!(
                "{}/notifications/incident?id={}",
                base.trim_end_matches('/'),
                descriptor.incident.id
            )
        });

        let request = NotificationRequest {
            id: uuid::Uuid::new_v4(),
            contact: ContactPayload::for_channel(&descriptor.contact, &descriptor.channel),
            object: descriptor.object,
            incident: descriptor.incident,
            event: descriptor.event,
            incident_url,
            channel_config,
        };

        match self.plugins.notify(&descriptor.channel, &request).await {
            Ok(()) => {
                info!(
                    contact = %descriptor.contact.full_name,
                    channel = %descriptor.channel,
                    history = descriptor.history_id,
                    "notification sent"
                );
                self.record(descriptor.history_id, NotifiedState::Sent).await;
            }
            Err(err) => {
                error!(
                    contact = %descriptor.contact.full_name,
                    channel = %descriptor.channel,
                    history = descriptor.history_id,
                    %err,
                    "notification failed"
                );
                self.record(descriptor.history_id, NotifiedState::Failed).await;
            }
        }
    }

    async fn record(&self, history_id: i64, state: NotifiedState) {
        let sent_at = match state {
            NotifiedState::Sent => Some(Utc::now()),
            _ => None,
        };
        if let Err(err) = self.db.update_notified(history_id, state, sent_at).await {
            error!(history = history_id, %err, "cannot record notification outcome");
        }
    }
}
