use anyhow::{Context, Result};
use clap::Parser;
use report_engine::config::EngineConfig;
use report_engine::control_plane::ControlPlaneClient;
use report_engine::db::SqlQueryExecutor;
use report_engine::delivery::TransferSink;
use report_engine::executor::{JobProcessor, ProcessorSettings, WorkerPool, CANCEL_GRACE};
use report_engine::queue::{consume, RedisJobSource};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// BLPOP window; bounds how long shutdown waits on an idle queue.
const QUEUE_POLL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = EngineConfig::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;
    info!(
        "Report engine starting ({}), {} workers, queue {} on {}:{}",
        config.environment, config.worker_count, config.queue_key, config.redis_host, config.redis_port
    );

    let control_plane = Arc::new(ControlPlaneClient::new(
        &config.control_plane_url,
        &config.control_plane_token,
        config.http_timeout(),
    )?);
    let processor = JobProcessor::new(
        control_plane.clone(),
        control_plane,
        Arc::new(SqlQueryExecutor::new()),
        Arc::new(TransferSink),
        ProcessorSettings {
            default_timeout: config.default_timeout(),
            cancel_grace: CANCEL_GRACE,
            output_dir: config.output_dir.clone(),
            format_override: config.format_override()?,
        },
    );

    let pool = WorkerPool::new(Arc::new(processor), config.queue_capacity());
    let running = pool.start(config.worker_count);

    let mut source =
        RedisJobSource::connect(&config.redis_host, config.redis_port, &config.queue_key, QUEUE_POLL)
            .await
            .context("connecting to the job queue")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested; finishing queued jobs");
        signal.cancel();
    });

    consume(&mut source, pool.submitter(), shutdown).await;
    pool.close();
    running.wait_for_shutdown().await;
    info!("Report engine stopped");
    Ok(())
}
