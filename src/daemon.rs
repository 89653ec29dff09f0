//! Process wiring: builds every component, spawns the long-lived tasks
//! and coordinates graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::db;
use crate::dispatch::NotificationDispatcher;
use crate::incident::IncidentEngine;
use crate::listener::Listener;
use crate::object::ObjectRegistry;
use crate::plugin::PluginRegistry;
use crate::runtime::{RuntimeCache, SourceLauncher};
use crate::source::StreamLauncher;

/// Runs the daemon until SIGINT/SIGTERM. Any error returned here is a
/// bootstrap failure; the process exits non-zero.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let token = CancellationToken::new();

    let db = db::connect(&config.database)
        .await
        .context("cannot open database")?;

    let registry = Arc::new(ObjectRegistry::new());
    let restored_muted = registry
        .restore_muted(&db)
        .await
        .context("cannot restore muted objects")?;
    info!(restored = restored_muted, "muted objects restored");

    let runtime = Arc::new(RuntimeCache::new(Arc::clone(&db)));

    let plugins = Arc::new(PluginRegistry::new(config.channels_dir.clone()));
    let channels = plugins.discover().await;
    info!(?channels, "channel plugins ready");

    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(IncidentEngine::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::clone(&runtime),
        dispatch_tx,
    ));

    let dispatcher = NotificationDispatcher::new(
        Arc::clone(&db),
        plugins,
        Arc::clone(&runtime),
        config.icingaweb2_url.clone(),
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(dispatch_rx, token.clone()));

    let launcher: Arc<dyn SourceLauncher> = Arc::new(StreamLauncher::new(
        Arc::clone(&engine),
        Arc::clone(&registry),
        config.api_timeout,
        config.icingaweb2_url.clone(),
        token.clone(),
    ));

    // The first load must succeed before anything processes events;
    // it also starts the stream clients for configured sources.
    runtime
        .refresh(Some(launcher.as_ref()))
        .await
        .context("cannot load runtime configuration")?;

    let open = engine
        .restore()
        .await
        .context("cannot restore open incidents")?;
    info!(open, "open incidents restored");
    let retriggered = engine.retrigger_open().await;
    debug!(retriggered, "open incidents retriggered");

    let refresh_task = tokio::spawn(Arc::clone(&runtime).run(
        Arc::clone(&launcher),
        config.runtime_refresh_interval,
        token.clone(),
    ));

    let listener = Listener {
        listen: config.listen.clone(),
        debug_password: config.debug_password.clone(),
        engine: Arc::clone(&engine),
        runtime: Arc::clone(&runtime),
    };
    let mut listener_task = tokio::spawn(listener.run(token.clone()));

    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("cannot install signal handler")?;

    tokio::select! {
        result = &mut listener_task => {
            token.cancel();
            let _ = refresh_task.await;
            let _ = dispatcher_task.await;
            result.context("listener task panicked")??;
            anyhow::bail!("listener stopped unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = term.recv() => info!("termination requested, shutting down"),
    }

    token.cancel();
    let _ = listener_task.await;
    let _ = refresh_task.await;
    let _ = dispatcher_task.await;
    info!("shutdown complete");
    Ok(())
}
