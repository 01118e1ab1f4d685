use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sysblock_relay::api::{self, ServerError};
use sysblock_relay::config::Settings;
use sysblock_relay::inspector::BlockInspector;
use sysblock_relay::provider::{BlockSource, HttpBlockSource};
use sysblock_relay::publisher::SubscriberHub;
use sysblock_relay::relay::Relay;
use sysblock_relay::store::ResultStore;
use sysblock_relay::upstream::UpstreamFeed;

/// Upper bound on waiting for background tasks after the server stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "relay terminated with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let settings = Settings::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    info!(?settings, "starting sysblock-relay");
    let addr = settings.listen_addr()?;

    let source: Arc<dyn BlockSource> = Arc::new(HttpBlockSource::new(settings.source_config())?);
    let inspector = BlockInspector::new(source, settings.inspector_config());

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let (feed, upstream_state) = UpstreamFeed::new(settings.upstream_config(), notify_tx);
    let relay = Arc::new(Relay::new(
        inspector,
        Arc::new(ResultStore::new()),
        Arc::new(SubscriberHub::new()),
        upstream_state,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed_task = tokio::spawn(feed.run(shutdown_rx));
    let dispatcher_task = tokio::spawn(Arc::clone(&relay).run_dispatcher(notify_rx));

    if settings.initial_scan_limit > 0 {
        let relay = Arc::clone(&relay);
        let limit = settings.initial_scan_limit;
        tokio::spawn(async move {
            info!("Scanning {} recent blocks", limit);
            let found = relay.scan_recent(limit).await;
            info!("Initial scan complete: {} matches", found.len());
        });
    }

    let listener = TcpListener::bind(addr).await?;
    api::serve(listener, relay, shutdown_signal()).await?;

    info!("Server stopped, shutting down upstream feed");
    shutdown_tx.send_replace(true);
    // The dispatcher ends once the feed drops its notification sender
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = feed_task.await;
        let _ = dispatcher_task.await;
    })
    .await
    .is_err()
    {
        warn!("Background tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
