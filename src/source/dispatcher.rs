//! Per-client event dispatcher.
//!
//! A single task per stream client owns the hand-over between live and
//! replayed events. In live-only mode every event goes straight to the
//! incident engine. During catch-up, live events are buffered while
//! replay events pass through and feed a per-name cache of the newest
//! replayed API timestamp; once the replay producer closes, buffered
//! events are drained and delivered unless the cache proves them stale.
//! Because the loop is single-tasked, buffer and cache are never
//! observed concurrently.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Backoff;
use super::api::ApiError;
use super::catchup::CatchupEvent;
use crate::core::Event;
use crate::incident::IncidentEngine;

const REPLAY_CAPACITY: usize = 128;

/// Starts one replay producer. Abstracted so the dispatcher loop can be
/// exercised without an upstream server.
pub(super) trait CatchupSpawner: Send + 'static {
    fn spawn(
        &self,
        tx: mpsc::Sender<Result<CatchupEvent, ApiError>>,
        token: CancellationToken,
    );
}

pub(super) struct SourceDispatcher<S> {
    pub engine: Arc<IncidentEngine>,
    pub spawner: S,
    pub source_name: String,
    pub token: CancellationToken,
}

/// A buffered live event is stale iff a replayed event for the same
/// name carried an API timestamp not older than it.
fn is_stale(cache: &HashMap<String, DateTime<Utc>>, ev: &Event) -> bool {
    cache.get(&ev.name).is_some_and(|&replayed| ev.time <= replayed)
}

impl<S: CatchupSpawner> SourceDispatcher<S> {
    pub async fn run(
        self,
        mut live_rx: mpsc::Receiver<Event>,
        mut catchup_rx: mpsc::Receiver<()>,
    ) {
        let mut replay_rx: Option<mpsc::Receiver<Result<CatchupEvent, ApiError>>> = None;
        let mut producer_token: Option<CancellationToken> = None;
        let mut buffer: VecDeque<Event> = VecDeque::new();
        let mut replay_cache: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut backoff = Backoff::new();
        let mut retry: Option<Pin<Box<Sleep>>> = None;

        loop {
            let catching_up = replay_rx.is_some() || retry.is_some();
            let mut start_catchup = false;

            tokio::select! {
                _ = self.token.cancelled() => {
                    if let Some(token) = producer_token.take() {
                        token.cancel();
                    }
                    debug!(source = %self.source_name, "dispatcher stopped");
                    return;
                }

                Some(()) = catchup_rx.recv() => {
                    retry = None;
                    start_catchup = true;
                }

                msg = async { replay_rx.as_mut().expect("guarded by arm condition").recv().await },
                    if replay_rx.is_some() =>
                {
                    match msg {
                        Some(Ok(replayed)) => {
                            let entry = replay_cache
                                .entry(replayed.event.name.clone())
                                .or_insert(replayed.api_time);
                            if replayed.api_time > *entry {
                                *entry = replayed.api_time;
                            }
                            self.deliver(replayed.event).await;
                        }
                        Some(Err(err)) => {
                            if let Some(token) = producer_token.take() {
                                token.cancel();
                            }
                            replay_rx = None;
                            let delay = backoff.next();
                            warn!(
                                source = %self.source_name,
                                %err,
                                retry_in = ?delay,
                                "catch-up failed"
                            );
                            retry = Some(Box::pin(tokio::time::sleep(delay)));
                        }
                        None => {
                            replay_rx = None;
                            producer_token = None;
                            backoff.reset();
                            let buffered = buffer.len();
                            while let Some(ev) = buffer.pop_front() {
                                if is_stale(&replay_cache, &ev) {
                                    debug!(
                                        source = %self.source_name,
                                        event = %ev.name,
                                        "dropping stale buffered event"
                                    );
                                } else {
                                    self.deliver(ev).await;
                                }
                            }
                            replay_cache.clear();
                            info!(source = %self.source_name, buffered, "catch-up complete");
                        }
                    }
                }

                _ = async { retry.as_mut().expect("guarded by arm condition").as_mut().await },
                    if retry.is_some() =>
                {
                    retry = None;
                    start_catchup = true;
                }

                ev = live_rx.recv() => {
                    match ev {
                        Some(ev) if catching_up => buffer.push_back(ev),
                        Some(ev) => self.deliver(ev).await,
                        None => {
                            if let Some(token) = producer_token.take() {
                                token.cancel();
                            }
                            return;
                        }
                    }
                }
            }

            if start_catchup {
                // An outstanding producer drains into its discarded
                // channel once cancelled.
                if let Some(token) = producer_token.take() {
                    token.cancel();
                }
                replay_cache.clear();
                let (tx, rx) = mpsc::channel(REPLAY_CAPACITY);
                let token = self.token.child_token();
                self.spawner.spawn(tx, token.clone());
                producer_token = Some(token);
                replay_rx = Some(rx);
                debug!(source = %self.source_name, "catch-up started");
            }
        }
    }

    async fn deliver(&self, ev: Event) {
        match self.engine.process_event(ev).await {
            Ok(()) => {}
            Err(err) if err.is_benign() => {
                debug!(source = %self.source_name, %err, "event ignored");
            }
            Err(err) => {
                warn!(source = %self.source_name, %err, "cannot process event");
            }
        }
    }
}
