use std::{path::Path, sync::Arc};

use anyhow::Context;
use submit_db::TaskStore;
use submit_migration::{Migrator, MigratorTrait};
use submit_server::{api, config::ServerConfig, state::AppState};
use submit_worker::{
    Collaborators, MarketplaceConfig, Notifier, TelegramConfig, VisionConfig, Worker,
    WorkerConfig,
    stages::{
        BundlePreparer, HttpDownloader, HttpMarketplace, LogNotifier, TelegramNotifier,
        VisionMetadataGenerator, ZipExtractor,
    },
};
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let Some(dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
        return None;
    };

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "submit-server.log"));
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Some(guard)
}

fn build_notifier() -> anyhow::Result<Arc<dyn Notifier>> {
    match TelegramConfig::from_env() {
        Some(cfg) => Ok(Arc::new(TelegramNotifier::new(cfg)?)),
        None => {
            tracing::info!("telegram is not configured; notifications go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = ServerConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let db = submit_db::connect(&config.database_url)
        .await
        .context("connect to database")?;

    // Apply migrations on boot (idempotent).
    Migrator::up(&db, None).await.context("apply migrations")?;

    let worker_config = WorkerConfig::from_env();
    tokio::fs::create_dir_all(&worker_config.data_root)
        .await
        .with_context(|| format!("create data root {}", worker_config.data_root.display()))?;

    let store = TaskStore::new(Arc::new(db))
        .with_max_attempts(worker_config.max_attempts)
        .with_lease(
            chrono::Duration::from_std(worker_config.claim_lease).context("claim lease")?,
        );

    let notifier = build_notifier()?;
    let collaborators = Collaborators {
        downloader: Arc::new(HttpDownloader::new(worker_config.download_max_bytes)?),
        extractor: Arc::new(ZipExtractor),
        preparer: Arc::new(BundlePreparer),
        metadata: Arc::new(VisionMetadataGenerator::new(VisionConfig::from_env())?),
        marketplace: Arc::new(HttpMarketplace::new(MarketplaceConfig::from_env())?),
        notifier: notifier.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Worker::new(store.clone(), collaborators, worker_config);
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let app = api::router(AppState { store, notifier });
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "submit-server HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("waiting for the worker to finish its current task");
    let _ = shutdown_tx.send(true);
    worker_handle.await.context("worker task panicked")?;
    Ok(())
}
