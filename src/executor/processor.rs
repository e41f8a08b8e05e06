//! Job Processor
//!
//! Drives one job through `processing -> {completed, failed}`. The
//! fetch/execute/stream sequence runs on its own task and races the job's
//! deadline; exactly one terminal update is posted, after the sequence has
//! been joined or torn down.

use super::pipeline::{run_pipeline, Progress};
use super::pool::{panic_message, JobHandler};
use crate::control_plane::{ReportFetcher, StatusReporter};
use crate::db::QueryExecutor;
use crate::delivery::{DeliveryRequest, DeliverySink};
use crate::error::{EngineError, Result};
use crate::models::{ExecutionStatus, ExecutionUpdate, Job};
use crate::otp::generate_otp;
use crate::output::OutputFormat;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a timed-out sequence gets to unwind before it is aborted.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Applied when the job carries no timeout.
    pub default_timeout: Duration,
    pub cancel_grace: Duration,
    /// Directory used when a report has no FTP server.
    pub output_dir: PathBuf,
    /// Forces one output format for every report.
    pub format_override: Option<OutputFormat>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_JOB_TIMEOUT,
            cancel_grace: CANCEL_GRACE,
            output_dir: PathBuf::from("output"),
            format_override: None,
        }
    }
}

#[derive(Clone)]
pub struct JobProcessor {
    reports: Arc<dyn ReportFetcher>,
    status: Arc<dyn StatusReporter>,
    queries: Arc<dyn QueryExecutor>,
    sink: Arc<dyn DeliverySink>,
    settings: ProcessorSettings,
}

impl JobProcessor {
    pub fn new(
        reports: Arc<dyn ReportFetcher>,
        status: Arc<dyn StatusReporter>,
        queries: Arc<dyn QueryExecutor>,
        sink: Arc<dyn DeliverySink>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            reports,
            status,
            queries,
            sink,
            settings,
        }
    }

    /// Effective deadline in whole seconds.
    fn timeout_secs(&self, job: &Job) -> u64 {
        if job.timeout_seconds > 0 {
            job.timeout_seconds
        } else {
            self.settings.default_timeout.as_secs().max(1)
        }
    }

    /// Run one job and return the terminal update that was posted.
    pub async fn process(&self, job: Job) -> ExecutionUpdate {
        let span = info_span!("job", execution.id = %job.execution_id, report.id = %job.report_id);
        self.process_inner(job).instrument(span).await
    }

    async fn process_inner(&self, job: Job) -> ExecutionUpdate {
        let started_at = Utc::now();
        if let Err(e) = self
            .status
            .update_execution(&job.execution_id, &ExecutionUpdate::processing(started_at))
            .await
        {
            warn!("Failed to report processing status: {}", e);
        }

        let timeout_secs = self.timeout_secs(&job);
        let cancel = CancellationToken::new();
        let progress = Progress::default();

        let mut sequence = tokio::spawn(
            self.clone()
                .run_sequence(job.clone(), cancel.clone(), progress.clone())
                .in_current_span(),
        );

        let outcome = tokio::select! {
            joined = &mut sequence => match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(EngineError::Panicked(panic_message(&*e.into_panic()))),
                Err(_) => Err(EngineError::Cancelled),
            },
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                cancel.cancel();
                if tokio::time::timeout(self.settings.cancel_grace, &mut sequence).await.is_err() {
                    warn!("Sequence still running {:?} after cancel; aborting", self.settings.cancel_grace);
                    sequence.abort();
                }
                Err(EngineError::Timeout(timeout_secs))
            }
        };

        let update = terminal_update(outcome, &progress);
        match update.status {
            ExecutionStatus::Completed => info!("Job {} completed", job.execution_id),
            _ => error!("Job {} failed: {}", job.execution_id, update.error_log),
        }
        if let Err(e) = self.status.update_execution(&job.execution_id, &update).await {
            warn!("Failed to report terminal status: {}", e);
        }
        update
    }

    /// Fetch, execute and stream. Returns the report's retention period.
    async fn run_sequence(
        self,
        job: Job,
        cancel: CancellationToken,
        progress: Progress,
    ) -> Result<Duration> {
        let report = self.reports.fetch_report(&job.report_id).await?;

        let format = self
            .settings
            .format_override
            .unwrap_or_else(|| OutputFormat::for_report(report.report_type));
        let request = DeliveryRequest::for_report(&report, format.extension(), &self.settings.output_dir)?;

        let query = self.queries.execute(&report, &job, cancel.child_token()).await?;
        let path = run_pipeline(
            query,
            format,
            &report.fields,
            self.sink.as_ref(),
            &request,
            &progress,
            cancel,
        )
        .await?;

        info!("Delivered {} ({} bytes)", path, progress.bytes());
        Ok(report.retention())
    }
}

/// Build the single terminal update for an outcome. Output path and size
/// are whatever was transferred, on both paths.
fn terminal_update(outcome: Result<Duration>, progress: &Progress) -> ExecutionUpdate {
    let finished_at = Utc::now();
    let mut update = ExecutionUpdate {
        status: ExecutionStatus::Failed,
        started_at: None,
        finished_at: Some(finished_at),
        output_path: progress.output_path(),
        file_size: progress.bytes(),
        error_log: String::new(),
        otp: String::new(),
        expires_at: None,
    };

    match outcome {
        Ok(retention) => {
            update.status = ExecutionStatus::Completed;
            update.otp = generate_otp().unwrap_or_else(|e| {
                warn!("Failed to generate OTP: {}", e);
                String::new()
            });
            update.expires_at = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|retention| finished_at.checked_add_signed(retention));
        }
        Err(e) => update.error_log = e.to_string(),
    }
    update
}

#[async_trait]
impl JobHandler for JobProcessor {
    async fn handle(&self, job: Job) {
        self.process(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_update_on_failure_keeps_progress() {
        let progress = Progress::default();
        let update = terminal_update(Err(EngineError::Delivery("refused".into())), &progress);
        assert_eq!(update.status, ExecutionStatus::Failed);
        assert_eq!(update.error_log, "refused");
        assert!(update.otp.is_empty());
        assert!(update.expires_at.is_none());
        assert!(update.finished_at.is_some());
    }

    #[test]
    fn test_terminal_update_on_success_sets_otp_and_expiry() {
        let update = terminal_update(Ok(Duration::from_secs(3600)), &Progress::default());
        assert_eq!(update.status, ExecutionStatus::Completed);
        assert_eq!(update.otp.len(), 6);
        let ttl = update.expires_at.unwrap() - update.finished_at.unwrap();
        assert_eq!(ttl.num_seconds(), 3600);
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            EngineError::Timeout(300).to_string(),
            "execution timed out after 300 seconds"
        );
    }
}
