//! Push a job payload onto the execution queue.

use anyhow::{bail, Context, Result};
use clap::Parser;
use redis::AsyncCommands;
use report_engine::models::Job;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "push-job")]
#[command(about = "Enqueue a report job for the engine")]
struct Args {
    /// Job JSON, inline
    #[arg(long, conflicts_with = "file")]
    json: Option<String>,

    /// Path to a file holding the job JSON
    #[arg(long)]
    file: Option<PathBuf>,

    #[arg(long, env = "REDIS_HOST", default_value = "redis")]
    redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    #[arg(long, env = "QUEUE_KEY", default_value = "rbdb_execution_queue")]
    queue_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let payload = match (&args.json, &args.file) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => bail!("pass --json or --file"),
    };

    // Reject payloads the engine would skip.
    let job = Job::from_payload(&payload).context("payload is not a valid job")?;

    let client = redis::Client::open(format!("redis://{}:{}/", args.redis_host, args.redis_port))?;
    let mut connection = client.get_multiplexed_async_connection().await?;
    let length: usize = connection.rpush(&args.queue_key, payload.trim()).await?;

    info!(
        "Queued execution {} on {} (length {})",
        job.execution_id, args.queue_key, length
    );
    Ok(())
}
