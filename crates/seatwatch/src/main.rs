use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use seatwatch::commands::CommandSurface;
use seatwatch::config::AppConfig;
use seatwatch::db::{OfferingStore, SubscriptionStore};
use seatwatch::harvest::SigaaHarvester;
use seatwatch::notify::{Dispatcher, Notifier, TelegramNotifier};
use seatwatch::server::{self, create_router, AppState};
use seatwatch::supervisor::{Supervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let offerings = Arc::new(
        OfferingStore::open(&config.storage.offerings_db)
            .with_context(|| format!("Failed to open {}", config.storage.offerings_db.display()))?,
    );
    let subscriptions = Arc::new(
        SubscriptionStore::open(&config.storage.subscriptions_db).with_context(|| {
            format!("Failed to open {}", config.storage.subscriptions_db.display())
        })?,
    );
    info!(
        offerings = offerings.count().unwrap_or_default(),
        "Stores opened"
    );

    // Bind before any task is spawned so a bad address fails fast.
    let listener = match &config.server {
        Some(server_config) => Some(server::bind(server_config).await?),
        None => None,
    };

    let cancel = CancellationToken::new();
    let notifier: Arc<dyn Notifier> =
        Arc::new(TelegramNotifier::new(config.telegram.clone(), cancel.clone())?);
    let harvester = SigaaHarvester::new(config.harvester.clone())?;

    let dispatcher = Dispatcher::new(
        notifier.clone(),
        subscriptions.clone(),
        config.notify.dispatch(),
    );
    let supervisor = Supervisor::new(
        harvester,
        offerings.clone(),
        dispatcher,
        notifier.clone(),
        SupervisorConfig {
            interval: config.scrape.interval(),
            failure_alert_threshold: config.scrape.failure_alert_threshold,
            operator_chat_id: config.notify.operator_chat_id,
        },
        cancel.clone(),
    );
    let status = supervisor.status();

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(supervisor.run()));

    let surface = CommandSurface::new(notifier.clone(), offerings.clone(), subscriptions.clone());
    tasks.push(tokio::spawn(surface.run(cancel.clone())));

    if let Some(listener) = listener {
        let app = create_router(Arc::new(AppState {
            offerings: offerings.clone(),
            subscriptions: subscriptions.clone(),
            status,
        }));
        let shutdown = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "HTTP server stopped with an error");
            }
        }));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal, stopping"),
    }
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    info!("Stopped");
    Ok(())
}
