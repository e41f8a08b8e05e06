//! Local filesystem delivery.

use super::{ByteStream, DestinationPath};
use crate::error::{EngineError, Result};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(super) async fn store(
    root: &Path,
    path: &DestinationPath,
    mut stream: ByteStream,
    cancel: CancellationToken,
) -> Result<String> {
    fs::create_dir_all(root.join(&path.directory))
        .await
        .map_err(|e| EngineError::Delivery(format!("create output directory: {e}")))?;

    let target = root.join(&path.file);
    let mut file = fs::File::create(&target)
        .await
        .map_err(|e| EngineError::Delivery(format!("create output file: {e}")))?;

    let written = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        copied = write_all(&mut stream, &mut file) => copied,
    };
    drop(file);

    match written {
        Ok(bytes) => {
            debug!("Wrote {} bytes to {}", bytes, target.display());
            Ok(target.to_string_lossy().into_owned())
        }
        Err(e) => {
            // A partial artifact must not be left behind.
            if let Err(remove) = fs::remove_file(&target).await {
                warn!("Failed to remove partial output {}: {}", target.display(), remove);
            }
            Err(e)
        }
    }
}

async fn write_all(stream: &mut ByteStream, file: &mut fs::File) -> Result<u64> {
    let written = tokio::io::copy(stream, file)
        .await
        .map_err(|e| EngineError::Delivery(format!("write output file: {e}")))?;
    file.flush().await?;
    Ok(written)
}
