//! FTP upload with suppaftp.
//!
//! The client is synchronous; it runs on a blocking thread and reads the
//! pipeline through a `SyncIoBridge`.

use super::{ByteStream, DestinationPath, FtpSettings};
use crate::error::{EngineError, Result};
use std::io::{self, Read};
use std::net::ToSocketAddrs;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) async fn upload(
    settings: FtpSettings,
    path: DestinationPath,
    stream: ByteStream,
    cancel: CancellationToken,
) -> Result<String> {
    let reader = Cancellable {
        inner: SyncIoBridge::new(stream),
        cancel,
    };
    tokio::task::spawn_blocking(move || store(&settings, &path, reader))
        .await
        .map_err(|e| EngineError::Delivery(format!("ftp upload task failed: {e}")))?
}

fn store<R: Read>(settings: &FtpSettings, path: &DestinationPath, mut reader: R) -> Result<String> {
    let addr = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| EngineError::Delivery(format!("ftp dial error: {e}")))?
        .next()
        .ok_or_else(|| {
            EngineError::Delivery(format!("ftp dial error: no address for {}", settings.host))
        })?;

    info!("Connecting to FTP {} as {}", addr, settings.username);
    let mut ftp = FtpStream::connect_timeout(addr, DIAL_TIMEOUT)
        .map_err(|e| EngineError::Delivery(format!("ftp dial error: {e}")))?;

    let result = (|| {
        ftp.login(settings.username.as_str(), settings.password.as_str())
            .map_err(ftp_error)?;
        ftp.transfer_type(FileType::Binary).map_err(ftp_error)?;
        // Fails when the directory already exists.
        if let Err(e) = ftp.mkdir(&path.directory) {
            debug!("FTP mkdir {}: {}", path.directory, e);
        }
        let written = ftp.put_file(&path.file, &mut reader).map_err(ftp_error)?;
        debug!("Stored {} bytes at {}", written, path.file);
        Ok(path.file.clone())
    })();

    if let Err(e) = ftp.quit() {
        debug!("FTP quit failed: {}", e);
    }
    result
}

fn ftp_error(e: suppaftp::FtpError) -> EngineError {
    EngineError::Delivery(e.to_string())
}

/// Fails the next read once the job is cancelled, so a blocked transfer
/// winds down at the following chunk.
struct Cancellable<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> Read for Cancellable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "transfer cancelled"));
        }
        self.inner.read(buf)
    }
}
