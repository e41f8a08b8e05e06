//! Engine configuration from flags and environment.

use crate::error::{EngineError, Result};
use crate::executor::MIN_QUEUE_CAPACITY;
use crate::output::OutputFormat;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "report-engine")]
#[command(about = "Executes queued report jobs and delivers their output")]
pub struct EngineConfig {
    /// Control plane API base URL
    #[arg(long, env = "CONTROL_PLANE_URL", default_value = "http://localhost:8000/api/v1")]
    pub control_plane_url: String,

    /// Bearer token for the control plane
    #[arg(long, env = "CONTROL_PLANE_TOKEN", default_value = "", hide_env_values = true)]
    pub control_plane_token: String,

    #[arg(long, env = "WORKER_COUNT", default_value_t = 5)]
    pub worker_count: usize,

    /// Internal queue capacity; raised to 100 when lower
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = MIN_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[arg(long, env = "APP_ENV", default_value = "local")]
    pub environment: String,

    #[arg(long, env = "REDIS_HOST", default_value = "redis")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Redis list holding job payloads
    #[arg(long, env = "QUEUE_KEY", default_value = "rbdb_execution_queue")]
    pub queue_key: String,

    /// Where artifacts go when a report has no FTP server
    #[arg(long, env = "OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    /// Job timeout used when a job carries none
    #[arg(long, env = "DEFAULT_TIMEOUT_SECS", default_value_t = 300)]
    pub default_timeout_secs: u64,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Force one output format (csv or xlsx) for every report
    #[arg(long, env = "OUTPUT_FORMAT")]
    pub output_format: Option<String>,

    /// Fallback tracing filter when RUST_LOG is unset
    #[arg(long, env = "LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(EngineError::Config("worker count must be at least 1".to_string()));
        }
        if self.control_plane_url.trim().is_empty() {
            return Err(EngineError::Config("control plane URL is required".to_string()));
        }
        self.format_override()?;
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(MIN_QUEUE_CAPACITY)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn format_override(&self) -> Result<Option<OutputFormat>> {
        self.output_format
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .map(str::parse)
            .transpose()
    }
}
