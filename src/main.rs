use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use gpu_reservations::config::AppConfig;
use gpu_reservations::db::Database;
use gpu_reservations::notify::LoggingNotificationSink;
use gpu_reservations::orchestrator::DockerOrchestrator;
use gpu_reservations::provider::local::LocalDiskProvider;
use gpu_reservations::{availability, disk, expiry, queue_runtime, AppContext};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gpu_reservations=info".into()),
        )
        .init();

    info!("starting gpu-reservations v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("database initialized");

    let orchestrator = Arc::new(DockerOrchestrator::connect(&config.docker_host)?);
    info!(docker_host = %config.docker_host, "orchestrator client initialized");

    let provider = Arc::new(LocalDiskProvider::open(&config.provider_local_base_dir)?);
    info!(base_dir = %config.provider_local_base_dir, "storage provider initialized");

    let notifier = Arc::new(LoggingNotificationSink);

    let ctx = AppContext::new(db, provider, orchestrator, notifier, config);

    spawn_ticker("availability", ctx.clone(), ctx.config.poll_interval_seconds, |ctx| {
        Box::pin(async move {
            if let Err(e) = availability::tick_availability(&ctx).await {
                warn!(error = %e, "availability tick failed");
            }
        })
    });

    spawn_ticker("expiry", ctx.clone(), ctx.config.poll_interval_seconds, |ctx| {
        Box::pin(async move {
            if let Err(e) = expiry::tick_expiry(&ctx).await {
                warn!(error = %e, "expiry tick failed");
            }
        })
    });

    spawn_ticker("disk reconciliation", ctx.clone(), 3600, |ctx| {
        Box::pin(async move {
            if let Err(e) = disk::reconciler::tick_reconciliation(&ctx).await {
                warn!(error = %e, "disk reconciliation tick failed");
            }
        })
    });

    info!("queue runtime starting");
    queue_runtime::run(ctx).await;

    Ok(())
}

/// Spawn a named background task that waits out one interval before its
/// first tick (matching `queue_runtime::run`'s own idiom), then calls
/// `work` forever on that cadence.
fn spawn_ticker<F>(name: &'static str, ctx: AppContext, interval_seconds: u64, work: F)
where
    F: Fn(AppContext) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            work(ctx.clone()).await;
        }
    });
    info!(name, interval_seconds, "background tick task scheduled");
}
