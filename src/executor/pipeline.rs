//! Streaming pipeline: cursor -> encoder -> bounded pipe -> delivery sink.
//!
//! The encoder is the only writer of the pipe and the sink's transport the
//! only reader. Both stages run concurrently and are joined before the
//! outcome is decided; the bytes read by the sink are counted as they pass.

use crate::db::cursor::OpenQuery;
use crate::delivery::{ByteCounter, CountingReader, DeliveryRequest, DeliverySink};
use crate::error::{EngineError, Result};
use crate::models::ReportField;
use crate::output::{encode, OutputFormat};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes buffered between the encoder and the sink before the encoder waits.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// What has been transferred so far. Readable while the pipeline runs and
/// after it was abandoned.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    bytes: ByteCounter,
    output_path: Arc<Mutex<String>>,
}

impl Progress {
    pub fn bytes(&self) -> u64 {
        self.bytes.get()
    }

    pub fn output_path(&self) -> String {
        self.output_path
            .lock()
            .map(|path| path.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_output_path(&self, path: &str) {
        let mut guard = self
            .output_path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = path.to_string();
    }
}

/// Stream an open query through the encoder into `sink`.
///
/// The cursor is released when encoding stops and the connection is closed
/// on every path, after both stages have finished. Returns the stored path.
pub async fn run_pipeline(
    query: OpenQuery,
    format: OutputFormat,
    fields: &[ReportField],
    sink: &dyn DeliverySink,
    request: &DeliveryRequest,
    progress: &Progress,
    cancel: CancellationToken,
) -> Result<String> {
    let OpenQuery { cursor, connection } = query;
    let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let reader = CountingReader::with_counter(reader, progress.bytes.clone());

    let encode_stage = async move {
        let encoded = encode(cursor, format, fields, &mut writer).await;
        // Dropping the writer is what signals end-of-stream to the sink.
        if let Err(e) = writer.shutdown().await {
            debug!("Pipe shutdown after encoding: {}", e);
        }
        drop(writer);
        encoded
    };

    let deliver_stage = async {
        let delivered = sink
            .deliver(request, Box::pin(reader), cancel.child_token())
            .await;
        if let Ok(path) = &delivered {
            progress.set_output_path(path);
        }
        delivered
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        (encoded, delivered) = async { tokio::join!(encode_stage, deliver_stage) } => {
            combine(encoded, delivered)
        }
    };

    connection.close().await;
    outcome
}

/// Decide the pipeline outcome from both stages. An encoder failure wins,
/// except a write into a pipe the failed sink already closed.
fn combine(encoded: Result<()>, delivered: Result<String>) -> Result<String> {
    match (encoded, delivered) {
        (Ok(()), delivered) => delivered,
        (Err(e), Err(delivery)) if is_closed_pipe(&e) => {
            debug!("Encoder stopped by closed pipe: {}", e);
            Err(delivery)
        }
        (Err(e), Err(delivery)) => {
            warn!("Delivery also failed: {}", delivery);
            Err(e)
        }
        (Err(e), Ok(path)) => {
            warn!("Encoding failed after the sink stored {}", path);
            Err(e)
        }
    }
}

fn is_closed_pipe(e: &EngineError) -> bool {
    matches!(e, EngineError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_error_takes_precedence() {
        let err = combine(
            Err(EngineError::Encoding("bad cell".into())),
            Err(EngineError::Delivery("refused".into())),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "bad cell");
    }

    #[test]
    fn test_closed_pipe_defers_to_sink_error() {
        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        let err = combine(
            Err(EngineError::Io(broken)),
            Err(EngineError::Delivery("550 permission denied".into())),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "550 permission denied");
    }

    #[test]
    fn test_progress_is_shared() {
        let progress = Progress::default();
        let clone = progress.clone();
        clone.set_output_path("2024-01-01-x/2024-01-01-00:00.csv");
        assert_eq!(progress.output_path(), "2024-01-01-x/2024-01-01-00:00.csv");
        assert_eq!(progress.bytes(), 0);
    }
}
