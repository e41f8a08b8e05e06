//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use report_engine::control_plane::{ReportFetcher, StatusReporter};
use report_engine::db::{Cursor, OpenQuery, QueryExecutor, SqlValue};
use report_engine::delivery::{ByteStream, DeliveryRequest, DeliverySink};
use report_engine::models::{ExecutionUpdate, Job, Report};
use report_engine::{EngineError, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Serves one fixed report, or a fetch error.
pub struct StaticReports(pub std::result::Result<Report, String>);

#[async_trait]
impl ReportFetcher for StaticReports {
    async fn fetch_report(&self, _report_id: &str) -> Result<Report> {
        self.0.clone().map_err(EngineError::ReportFetch)
    }
}

/// Records every status update; optionally fails each call after recording.
#[derive(Default)]
pub struct RecordingStatus {
    pub updates: Mutex<Vec<(String, ExecutionUpdate)>>,
    pub fail: bool,
}

impl RecordingStatus {
    pub fn updates(&self) -> Vec<ExecutionUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(_, update)| update.clone())
            .collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingStatus {
    async fn update_execution(&self, execution_id: &str, update: &ExecutionUpdate) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((execution_id.to_string(), update.clone()));
        if self.fail {
            return Err(EngineError::StatusUpdate("control plane down".into()));
        }
        Ok(())
    }
}

/// Returns in-memory rows, optionally after a delay that ignores cancellation.
pub struct FixedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub delay: Duration,
}

impl FixedRows {
    pub fn new(columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl QueryExecutor for FixedRows {
    async fn execute(&self, _report: &Report, _job: &Job, _cancel: CancellationToken) -> Result<OpenQuery> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(OpenQuery::in_memory(Cursor::from_rows(
            self.columns.clone(),
            self.rows.clone(),
        )))
    }
}

/// Reads the whole stream into memory. With `fail_after`, reads that many
/// bytes and then rejects the transfer.
#[derive(Default)]
pub struct MemorySink {
    pub received: Mutex<Vec<u8>>,
    pub fail_after: Option<usize>,
}

#[async_trait]
impl DeliverySink for MemorySink {
    async fn deliver(
        &self,
        request: &DeliveryRequest,
        mut stream: ByteStream,
        _cancel: CancellationToken,
    ) -> Result<String> {
        let mut buf = Vec::new();
        match self.fail_after {
            Some(limit) => {
                buf.resize(limit, 0);
                stream.read_exact(&mut buf).await?;
                self.received.lock().unwrap().extend_from_slice(&buf);
                Err(EngineError::Delivery("disk full".into()))
            }
            None => {
                stream.read_to_end(&mut buf).await?;
                self.received.lock().unwrap().extend_from_slice(&buf);
                Ok(format!("memory/{}.{}", request.report_name, request.extension))
            }
        }
    }
}

pub fn numbered_rows(count: i64) -> Vec<Vec<SqlValue>> {
    (0..count)
        .map(|i| vec![SqlValue::Int(i), SqlValue::Text(format!("row number {i}"))])
        .collect()
}
