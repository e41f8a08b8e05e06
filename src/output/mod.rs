//! Output Encoder
//!
//! Turns a cursor into an encoded byte stream in a single forward pass.

mod csv_writer;
pub mod projection;
mod xlsx_writer;

pub use projection::{Cell, Projection};

use crate::db::cursor::Cursor;
use crate::error::{EngineError, Result};
use crate::models::{ReportField, ReportType};
use std::fmt;
use std::str::FromStr;
use tokio::io::AsyncWrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Xlsx,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
        }
    }

    /// Default format for a report type: spreadsheets for SQL and visual
    /// reports, CSV for everything else.
    pub fn for_report(report_type: ReportType) -> Self {
        match report_type {
            ReportType::Sql | ReportType::Visual => Self::Xlsx,
            _ => Self::Csv,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "xlsx" => Ok(Self::Xlsx),
            other => Err(EngineError::Config(format!("unsupported format: {other}"))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Encode every row of `cursor` into `out`.
///
/// The cursor is consumed and dropped when encoding stops, which releases
/// the driver. `out` is flushed but not shut down.
pub async fn encode<W>(
    cursor: Cursor,
    format: OutputFormat,
    fields: &[ReportField],
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let projection = Projection::new(cursor.columns(), fields);
    match format {
        OutputFormat::Csv => csv_writer::write_csv(cursor, &projection, out).await,
        OutputFormat::Xlsx => xlsx_writer::write_xlsx(cursor, projection, out).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::value::SqlValue;

    #[test]
    fn test_format_selection() {
        assert_eq!(OutputFormat::for_report(ReportType::Sql), OutputFormat::Xlsx);
        assert_eq!(OutputFormat::for_report(ReportType::Visual), OutputFormat::Xlsx);
        assert_eq!(OutputFormat::for_report(ReportType::Service), OutputFormat::Csv);
        assert_eq!(OutputFormat::for_report(ReportType::Other), OutputFormat::Csv);
        assert_eq!("XLSX".parse::<OutputFormat>().unwrap(), OutputFormat::Xlsx);
        assert!("pdf".parse::<OutputFormat>().is_err());
    }

    #[tokio::test]
    async fn test_encode_applies_projection() {
        let fields = vec![
            ReportField {
                source_field: "id".into(),
                is_visible: true,
                ..ReportField::default()
            },
            ReportField {
                source_field: "email".into(),
                is_visible: false,
                ..ReportField::default()
            },
            ReportField {
                source_field: "created".into(),
                is_visible: true,
                alias: "Created".into(),
                format: "YYYY-MM-DD".into(),
                ..ReportField::default()
            },
        ];
        let cursor = Cursor::from_rows(
            vec!["id".into(), "email".into(), "name".into(), "created".into()],
            vec![vec![
                SqlValue::Int(1),
                SqlValue::Text("a@example.com".into()),
                SqlValue::Text("Ann".into()),
                SqlValue::Text("2024-01-05 10:30:00".into()),
            ]],
        );
        let mut out = Vec::new();
        encode(cursor, OutputFormat::Csv, &fields, &mut out).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "id,name,Created\n1,Ann,2024-01-05\n"
        );
    }
}
