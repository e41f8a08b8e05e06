//! Delivery Sinks
//!
//! A sink accepts the encoded byte stream of one job and reports the path it
//! was stored under.

pub mod counting;
mod ftp;
mod local;

pub use counting::{ByteCounter, CountingReader};

use crate::db::connection::{port_key, string_key};
use crate::error::{EngineError, Result};
use crate::models::{Report, RemoteServer};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FTP_PORT: u16 = 21;

/// The read side of the pipeline, handed to a sink.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Consume `stream` to its end and return the stored path.
    ///
    /// On failure the sink drops the stream, which unblocks the encoder.
    async fn deliver(
        &self,
        request: &DeliveryRequest,
        stream: ByteStream,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// FTP server settings typed from a server descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for FtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

impl FtpSettings {
    pub fn from_server(server: &RemoteServer) -> Result<Self> {
        let config = &server.connection_config;
        let host = string_key(config, "host")
            .ok_or_else(|| EngineError::Delivery("ftp server host is not configured".to_string()))?;
        let port = port_key(config)
            .map_err(|e| EngineError::Delivery(e.to_string()))?
            .unwrap_or(DEFAULT_FTP_PORT);
        Ok(Self {
            host,
            port,
            username: string_key(config, "username").unwrap_or_default(),
            password: string_key(config, "password").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ftp(FtpSettings),
    /// Local directory the artifact is written under.
    Directory(PathBuf),
}

/// Everything a sink needs to place one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub report_name: String,
    pub extension: String,
    pub destination: Destination,
}

impl DeliveryRequest {
    /// Deliver over FTP when the report carries a server, otherwise into
    /// `output_dir`.
    pub fn for_report(report: &Report, extension: &str, output_dir: &std::path::Path) -> Result<Self> {
        let destination = match report.ftp_target() {
            Some(server) => Destination::Ftp(FtpSettings::from_server(server)?),
            None => Destination::Directory(output_dir.to_path_buf()),
        };
        Ok(Self {
            report_name: report.name.clone(),
            extension: extension.to_string(),
            destination,
        })
    }
}

/// Dated location of an artifact: `{date}-{name}/{date}-{HH:MM}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPath {
    pub directory: String,
    pub file: String,
}

impl DestinationPath {
    pub fn new(report_name: &str, extension: &str, at: NaiveDateTime) -> Self {
        let date = at.format("%Y-%m-%d");
        let name = report_name.replace(['/', '\\'], "_");
        let directory = format!("{date}-{name}");
        let file = format!("{directory}/{date}-{}.{extension}", at.format("%H:%M"));
        Self { directory, file }
    }

    pub fn now(report_name: &str, extension: &str) -> Self {
        Self::new(report_name, extension, chrono::Local::now().naive_local())
    }
}

/// Routes each request to FTP or the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferSink;

#[async_trait]
impl DeliverySink for TransferSink {
    async fn deliver(
        &self,
        request: &DeliveryRequest,
        stream: ByteStream,
        cancel: CancellationToken,
    ) -> Result<String> {
        let path = DestinationPath::now(&request.report_name, &request.extension);
        match &request.destination {
            Destination::Ftp(settings) => ftp::upload(settings.clone(), path, stream, cancel).await,
            Destination::Directory(root) => local::store(root, &path, stream, cancel).await,
        }
    }
}
