//! Stream clients for upstream monitoring sources.
//!
//! One client per configured source, each running in its own task. A
//! client cycles through three phases: connect (subscribe to the
//! upstream push stream), catch-up (reconcile state missed while
//! disconnected) and live (translate and deliver pushed events). The
//! per-client dispatcher serializes replayed and live events so no
//! duplicates or out-of-order transitions reach the incident engine.

pub mod api;
mod catchup;
mod dispatcher;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Event, SourceId};
use crate::db::SourceRow;
use crate::incident::IncidentEngine;
use crate::object::ObjectRegistry;
use crate::runtime::SourceLauncher;

use api::{ApiError, IcingaClient, StreamMessage, TranslateContext};
use catchup::CatchupEvent;
use dispatcher::{CatchupSpawner, SourceDispatcher};

pub use catchup::CatchupEvent as ReplayEvent;

/// Reconnect and catch-up retry backoff: 1 s doubling, capped at
/// 3 min, reset on success.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(180);

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

/// Fresh per-subscription queue name: 128 random bits, hex encoded.
fn queue_name() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Replay producer bound to one Icinga 2 API client.
struct IcingaCatchup {
    api: Arc<IcingaClient>,
    ctx: TranslateContext,
    registry: Arc<ObjectRegistry>,
}

impl CatchupSpawner for IcingaCatchup {
    fn spawn(&self, tx: mpsc::Sender<Result<CatchupEvent, ApiError>>, token: CancellationToken) {
        tokio::spawn(catchup::run_catchup(
            Arc::clone(&self.api),
            self.ctx.clone(),
            Arc::clone(&self.registry),
            tx,
            token,
        ));
    }
}

pub struct SourceClient {
    source: Arc<SourceRow>,
    api: Arc<IcingaClient>,
    ctx: TranslateContext,
    engine: Arc<IncidentEngine>,
    registry: Arc<ObjectRegistry>,
    token: CancellationToken,
}

impl SourceClient {
    pub fn new(
        source: Arc<SourceRow>,
        engine: Arc<IncidentEngine>,
        registry: Arc<ObjectRegistry>,
        api_timeout: Duration,
        icingaweb2_url: Option<String>,
        token: CancellationToken,
    ) -> Result<Self, ApiError> {
        let api = Arc::new(IcingaClient::new(&source, api_timeout)?);
        let ctx = TranslateContext {
            source_id: source.id,
            icingaweb2_url,
        };
        Ok(Self {
            source,
            api,
            ctx,
            engine,
            registry,
            token,
        })
    }

    /// Runs the client until its token is cancelled: reconnect loop
    /// with backoff, catch-up on every successful connect, streaming
    /// into the dispatcher in between.
    pub async fn process(self) {
        let (live_tx, live_rx) = mpsc::channel(1024);
        let (catchup_tx, catchup_rx) = mpsc::channel(2);

        let dispatcher = SourceDispatcher {
            engine: Arc::clone(&self.engine),
            spawner: IcingaCatchup {
                api: Arc::clone(&self.api),
                ctx: self.ctx.clone(),
                registry: Arc::clone(&self.registry),
            },
            source_name: self.source.name.clone(),
            token: self.token.clone(),
        };
        let dispatcher_task = tokio::spawn(dispatcher.run(live_rx, catchup_rx));

        let mut backoff = Backoff::new();
        loop {
            if self.token.is_cancelled() {
                break;
            }
            match self
                .connect_and_stream(&mut backoff, &live_tx, &catchup_tx)
                .await
            {
                Ok(()) => debug!(source = %self.source.name, "event stream ended"),
                Err(err) => warn!(source = %self.source.name, %err, "event stream failed"),
            }
            if self.token.is_cancelled() {
                break;
            }
            let delay = backoff.next();
            debug!(source = %self.source.name, reconnect_in = ?delay, "reconnecting");
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        drop(live_tx);
        let _ = dispatcher_task.await;
        info!(source = %self.source.name, "stream client stopped");
    }

    async fn connect_and_stream(
        &self,
        backoff: &mut Backoff,
        live_tx: &mpsc::Sender<Event>,
        catchup_tx: &mpsc::Sender<()>,
    ) -> Result<(), ApiError> {
        let queue = queue_name();
        // Race the subscription against the connect budget; on timeout
        // the dropped future aborts the in-flight request.
        let response =
            match tokio::time::timeout(api::CONNECT_TIMEOUT, self.api.subscribe(&queue)).await {
                Ok(result) => result?,
                Err(_) => return Err(ApiError::ConnectTimeout),
            };
        info!(source = %self.source.name, queue = %queue, "subscribed to event stream");
        backoff.reset();

        // Catch-up precedes live processing after every (re-)connect.
        if catchup_tx.send(()).await.is_err() {
            return Ok(());
        }

        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        loop {
            tokio::select! {
                // Dropping the body stream closes the connection.
                _ = self.token.cancelled() => return Ok(()),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        pending.extend_from_slice(&bytes);
                        while let Some(line) = take_line(&mut pending) {
                            self.handle_line(&line, live_tx).await;
                        }
                    }
                    Some(Err(err)) => return Err(ApiError::Http(err)),
                    None => return Ok(()),
                }
            }
        }
    }

    async fn handle_line(&self, line: &str, live_tx: &mpsc::Sender<Event>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let msg: StreamMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(source = %self.source.name, %err, "ignoring unhandled stream message");
                return;
            }
        };
        if let Some(ev) = api::translate(msg, &self.ctx) {
            let _ = live_tx.send(ev).await;
        }
    }
}

fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let pos = pending.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = pending.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned())
}

/// Starts and stops stream client tasks as the runtime configuration
/// changes.
pub struct StreamLauncher {
    engine: Arc<IncidentEngine>,
    registry: Arc<ObjectRegistry>,
    api_timeout: Duration,
    icingaweb2_url: Option<String>,
    token: CancellationToken,
    clients: StdMutex<HashMap<SourceId, CancellationToken>>,
}

impl StreamLauncher {
    pub fn new(
        engine: Arc<IncidentEngine>,
        registry: Arc<ObjectRegistry>,
        api_timeout: Duration,
        icingaweb2_url: Option<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            registry,
            api_timeout,
            icingaweb2_url,
            token,
            clients: StdMutex::new(HashMap::new()),
        }
    }
}

impl SourceLauncher for StreamLauncher {
    fn launch(&self, source: Arc<SourceRow>) {
        if source.kind != "icinga2" {
            debug!(source = source.id, kind = %source.kind, "source has no stream client");
            return;
        }
        let token = self.token.child_token();
        match SourceClient::new(
            Arc::clone(&source),
            Arc::clone(&self.engine),
            Arc::clone(&self.registry),
            self.api_timeout,
            self.icingaweb2_url.clone(),
            token.clone(),
        ) {
            Ok(client) => {
                let mut clients = self.clients.lock().expect("launcher lock poisoned");
                if let Some(old) = clients.insert(source.id, token) {
                    old.cancel();
                }
                tokio::spawn(client.process());
            }
            Err(err) => {
                warn!(source = source.id, %err, "cannot start stream client");
            }
        }
    }

    fn stop(&self, source_id: SourceId) {
        let token = self
            .clients
            .lock()
            .expect("launcher lock poisoned")
            .remove(&source_id);
        if let Some(token) = token {
            token.cancel();
        }
    }
}
