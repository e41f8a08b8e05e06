//! CSV encoding.

use super::projection::Projection;
use crate::db::cursor::Cursor;
use crate::error::{EngineError, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Encoded bytes are handed to the output once this much is buffered.
const FLUSH_THRESHOLD: usize = 64 * 1024;

pub(crate) async fn write_csv<W>(mut cursor: Cursor, projection: &Projection, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut writer = buffered();

    // A record with no fields would render as `""`.
    if !projection.is_empty() {
        writer.write_record(projection.headers()).map_err(csv_error)?;
    }

    let mut record: Vec<String> = Vec::with_capacity(projection.len());
    while let Some(row) = cursor.next_row().await? {
        record.clear();
        record.extend(projection.cells(&row).map(|cell| cell.as_text().into_owned()));
        writer.write_record(&record).map_err(csv_error)?;

        if writer.get_ref().len() >= FLUSH_THRESHOLD {
            drain(&mut writer, out).await?;
        }
    }

    drain(&mut writer, out).await?;
    out.flush().await?;
    Ok(())
}

fn buffered() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .flexible(false)
        .from_writer(Vec::with_capacity(FLUSH_THRESHOLD))
}

/// Hand everything encoded so far to `out` and continue with a fresh buffer.
async fn drain<W>(writer: &mut csv::Writer<Vec<u8>>, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let full = std::mem::replace(writer, buffered());
    let buffer = full
        .into_inner()
        .map_err(|e| EngineError::Encoding(format!("csv: {}", e.error())))?;
    out.write_all(&buffer).await?;
    Ok(())
}

fn csv_error(e: csv::Error) -> EngineError {
    EngineError::Encoding(format!("csv: {e}"))
}
