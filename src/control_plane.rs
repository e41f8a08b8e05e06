//! Control plane client
//!
//! Fetches report definitions and posts execution status transitions.

use crate::error::{EngineError, Result};
use crate::models::{ExecutionUpdate, Report};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait ReportFetcher: Send + Sync {
    async fn fetch_report(&self, report_id: &str) -> Result<Report>;
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn update_execution(&self, execution_id: &str, update: &ExecutionUpdate) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
}

/// HTTP client for the control plane API.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
    }
}

#[async_trait]
impl ReportFetcher for ControlPlaneClient {
    async fn fetch_report(&self, report_id: &str) -> Result<Report> {
        let url = format!("{}/reports/{}", self.base_url, report_id);
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| EngineError::ReportFetch(format!("failed to fetch report: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(EngineError::ReportFetch(format!(
                "failed to fetch report, status: {}",
                response.status().as_u16()
            )));
        }

        let envelope: Envelope<Report> = response
            .json()
            .await
            .map_err(|e| EngineError::ReportFetch(format!("failed to decode report: {e}")))?;
        envelope.data.ok_or_else(|| {
            EngineError::ReportFetch(format!("report {report_id} not found in response"))
        })
    }
}

#[async_trait]
impl StatusReporter for ControlPlaneClient {
    async fn update_execution(&self, execution_id: &str, update: &ExecutionUpdate) -> Result<()> {
        let url = format!("{}/executions/{}", self.base_url, execution_id);
        let response = self
            .authorized(self.http.put(&url))
            .json(update)
            .send()
            .await
            .map_err(|e| EngineError::StatusUpdate(format!("failed to update execution: {e}")))?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(EngineError::StatusUpdate(format!(
                "failed to update execution, status: {}",
                status.as_u16()
            ))),
        }
    }
}
