//! XLSX encoding with rust_xlsxwriter.
//!
//! The worksheet runs in constant-memory mode, so rows are spooled to disk
//! as they are written rather than held in memory. The writer is
//! synchronous and drives the cursor from a blocking thread. The zip
//! container needs a seekable target, so the finished archive is saved to an
//! anonymous temporary file and then streamed to the output.

use super::projection::{Cell, Projection};
use crate::db::cursor::Cursor;
use crate::error::{EngineError, Result};
use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use std::fs::File;
use std::io::Seek;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const SHEET_NAME: &str = "Sheet1";

pub(crate) async fn write_xlsx<W>(cursor: Cursor, projection: Projection, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let spooled = tokio::task::spawn_blocking(move || build_workbook(cursor, &projection))
        .await
        .map_err(|e| EngineError::Encoding(format!("xlsx writer task failed: {e}")))??;

    let mut archive = tokio::fs::File::from_std(spooled);
    tokio::io::copy(&mut archive, out).await?;
    out.flush().await?;
    Ok(())
}

/// Write every row and save the archive, returning it rewound to the start.
fn build_workbook(mut cursor: Cursor, projection: &Projection) -> Result<File> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet_with_constant_memory();
    sheet.set_name(SHEET_NAME).map_err(xlsx_error)?;

    for (col, header) in projection.headers().enumerate() {
        sheet
            .write_string(0, column_index(col)?, header)
            .map_err(xlsx_error)?;
    }

    let mut row_index: u32 = 1;
    while let Some(row) = cursor.blocking_next_row()? {
        for (col, cell) in projection.cells(&row).enumerate() {
            write_cell(sheet, row_index, column_index(col)?, &cell)?;
        }
        row_index = row_index
            .checked_add(1)
            .ok_or_else(|| EngineError::Encoding("xlsx row limit exceeded".to_string()))?;
    }
    drop(cursor);

    let mut archive = tempfile::tempfile()?;
    workbook.save_to_writer(&mut archive).map_err(xlsx_error)?;
    archive.rewind()?;
    Ok(archive)
}

fn write_cell(sheet: &mut Worksheet, row: u32, col: u16, cell: &Cell<'_>) -> Result<()> {
    let written = match cell {
        Cell::Empty => return Ok(()),
        // Integers beyond f64's exact range go out as text.
        Cell::Int(i) if i.unsigned_abs() <= (1u64 << 53) => sheet.write_number(row, col, *i as f64),
        Cell::Int(i) => sheet.write_string(row, col, i.to_string()),
        Cell::Number(n) => sheet.write_number(row, col, *n),
        Cell::Bool(b) => sheet.write_boolean(row, col, *b),
        Cell::Text(s) => sheet.write_string(row, col, s.as_ref()),
    };
    written.map(|_| ()).map_err(xlsx_error)
}

fn column_index(col: usize) -> Result<u16> {
    u16::try_from(col).map_err(|_| EngineError::Encoding("xlsx column limit exceeded".to_string()))
}

fn xlsx_error(e: XlsxError) -> EngineError {
    EngineError::Encoding(format!("xlsx: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::value::SqlValue;
    use crate::models::ReportField;
    use std::io::Read;

    struct Unpacked {
        sheet_names: Vec<String>,
        sheet: String,
        shared_strings: String,
    }

    fn unpack(bytes: Vec<u8>) -> Unpacked {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let sheet_names = archive
            .file_names()
            .filter(|name| name.starts_with("xl/worksheets/sheet") && name.ends_with(".xml"))
            .map(str::to_string)
            .collect();
        let mut read = |name: &str| {
            let mut text = String::new();
            if let Ok(mut entry) = archive.by_name(name) {
                entry.read_to_string(&mut text).unwrap();
            }
            text
        };
        Unpacked {
            sheet: read("xl/worksheets/sheet1.xml"),
            shared_strings: read("xl/sharedStrings.xml"),
            sheet_names,
        }
    }

    fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
        let start = text.find(open)? + open.len();
        let len = text[start..].find(close)?;
        Some(&text[start..start + len])
    }

    fn inner_text(xml: &str) -> Option<String> {
        let open = xml.find("<t")?;
        let body = &xml[open..];
        let start = body.find('>')? + 1;
        let len = body[start..].find("</t>")?;
        Some(body[start..start + len].to_string())
    }

    /// Displayed value of a cell, resolving shared strings when used.
    fn cell(unpacked: &Unpacked, reference: &str) -> Option<String> {
        let cell = between(&unpacked.sheet, &format!("<c r=\"{reference}\""), "</c>")?;
        if cell.contains("t=\"s\"") {
            let index: usize = between(cell, "<v>", "</v>")?.parse().ok()?;
            let item = unpacked.shared_strings.split("<si>").nth(index + 1)?;
            return inner_text(item);
        }
        if cell.contains("<t") {
            return inner_text(cell);
        }
        between(cell, "<v>", "</v>").map(str::to_string)
    }

    #[tokio::test]
    async fn test_sheet_layout_follows_projection() {
        let fields = vec![
            ReportField {
                source_field: "EMAIL".into(),
                is_visible: true,
                alias: "Customer Email".into(),
                ..ReportField::default()
            },
            ReportField {
                source_field: "secret".into(),
                is_visible: false,
                ..ReportField::default()
            },
        ];
        let cursor = Cursor::from_rows(
            vec!["id".into(), "email".into(), "secret".into(), "name".into()],
            vec![
                vec![
                    SqlValue::Int(7),
                    SqlValue::Text("ann@example.com".into()),
                    SqlValue::Text("hunter2".into()),
                    SqlValue::Text("Ann".into()),
                ],
                vec![
                    SqlValue::Int(8),
                    SqlValue::Null,
                    SqlValue::Text("swordfish".into()),
                    SqlValue::Text("Bob".into()),
                ],
            ],
        );
        let projection = Projection::new(cursor.columns(), &fields);
        let mut out = Vec::new();
        write_xlsx(cursor, projection, &mut out).await.unwrap();

        let unpacked = unpack(out);
        assert_eq!(unpacked.sheet_names, vec!["xl/worksheets/sheet1.xml".to_string()]);

        assert_eq!(cell(&unpacked, "A1").as_deref(), Some("id"));
        assert_eq!(cell(&unpacked, "B1").as_deref(), Some("Customer Email"));
        assert_eq!(cell(&unpacked, "C1").as_deref(), Some("name"));
        assert_eq!(cell(&unpacked, "D1"), None);

        assert_eq!(cell(&unpacked, "A2").as_deref(), Some("7"));
        assert_eq!(cell(&unpacked, "B2").as_deref(), Some("ann@example.com"));
        assert_eq!(cell(&unpacked, "C2").as_deref(), Some("Ann"));
        assert_eq!(cell(&unpacked, "A3").as_deref(), Some("8"));
        assert_eq!(cell(&unpacked, "B3"), None);
        assert_eq!(cell(&unpacked, "C3").as_deref(), Some("Bob"));
        assert_eq!(cell(&unpacked, "A4"), None);

        let all_text = format!("{}{}", unpacked.sheet, unpacked.shared_strings);
        assert!(!all_text.contains("hunter2"));
        assert!(!all_text.contains("secret"));
    }

    #[tokio::test]
    async fn test_produces_zip_container() {
        let cursor = Cursor::from_rows(
            vec!["id".into(), "name".into()],
            vec![vec![SqlValue::Int(7), SqlValue::Text("Ann".into())]],
        );
        let projection = Projection::new(cursor.columns(), &[]);
        let mut out = Vec::new();
        write_xlsx(cursor, projection, &mut out).await.unwrap();
        assert!(out.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn test_cursor_error_propagates() {
        let cursor = Cursor::from_results(
            vec!["id".into()],
            vec![Err(EngineError::Query("lost connection".into()))],
        );
        let projection = Projection::new(cursor.columns(), &[]);
        let mut out = Vec::new();
        let err = write_xlsx(cursor, projection, &mut out).await.unwrap_err();
        assert_eq!(err.to_string(), "lost connection");
        assert!(out.is_empty());
    }
}
