//! Column projection and display formatting.
//!
//! A projection is derived once per job from the report's field set and the
//! cursor's column names, then applied to every row.

use crate::db::value::SqlValue;
use crate::models::ReportField;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Layout used to parse textual date-times and to render native ones.
const DATETIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_LAYOUT: &str = "%Y-%m-%d";

/// One output cell after projection and formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell<'a> {
    Empty,
    Int(i64),
    Number(f64),
    Bool(bool),
    Text(Cow<'a, str>),
}

impl Cell<'_> {
    /// Text form, as written to CSV.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Cell::Empty => Cow::Borrowed(""),
            Cell::Int(i) => Cow::Owned(i.to_string()),
            Cell::Number(n) => Cow::Owned(n.to_string()),
            Cell::Bool(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
            Cell::Text(s) => Cow::Borrowed(s.as_ref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct OutputColumn {
    /// Position in the cursor's row.
    source: usize,
    header: String,
    /// strftime layout, when the field carries a display format.
    layout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    columns: Vec<OutputColumn>,
}

#[derive(Default)]
struct FieldRules<'a> {
    visible: HashMap<String, bool>,
    aliases: HashMap<String, &'a str>,
    formats: HashMap<String, &'a str>,
}

impl<'a> FieldRules<'a> {
    /// Later fields for the same source column override earlier ones;
    /// empty aliases and formats never override.
    fn from_fields(fields: &'a [ReportField]) -> Self {
        let mut rules = Self::default();
        for field in fields {
            let key = field.source_field.to_lowercase();
            if !field.alias.is_empty() {
                rules.aliases.insert(key.clone(), &field.alias);
            }
            if !field.format.is_empty() {
                rules.formats.insert(key.clone(), &field.format);
            }
            rules.visible.insert(key, field.is_visible);
        }
        rules
    }
}

impl Projection {
    /// Build the projection for `columns`, in the query's native order.
    ///
    /// A column is dropped only when a field names it and marks it hidden.
    /// With no column metadata (an empty result from a driver that reports
    /// columns with rows), the header falls back to the visible fields in
    /// `order_position` order.
    pub fn new(columns: &[String], fields: &[ReportField]) -> Self {
        if columns.is_empty() {
            return Self::from_fields(fields);
        }

        let rules = FieldRules::from_fields(fields);
        let columns = columns
            .iter()
            .enumerate()
            .filter_map(|(source, name)| {
                let key = name.to_lowercase();
                if rules.visible.get(&key) == Some(&false) {
                    return None;
                }
                Some(OutputColumn {
                    source,
                    header: rules
                        .aliases
                        .get(&key)
                        .map(|alias| alias.to_string())
                        .unwrap_or_else(|| name.clone()),
                    layout: rules.formats.get(&key).map(|token| layout_for(token)),
                })
            })
            .collect();
        Self { columns }
    }

    fn from_fields(fields: &[ReportField]) -> Self {
        let mut visible: Vec<&ReportField> = fields.iter().filter(|f| f.is_visible).collect();
        visible.sort_by_key(|f| f.order_position);
        let columns = visible
            .into_iter()
            .enumerate()
            .map(|(source, field)| OutputColumn {
                source,
                header: if field.alias.is_empty() {
                    field.source_field.clone()
                } else {
                    field.alias.clone()
                },
                layout: None,
            })
            .collect();
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.header.as_str())
    }

    /// Project and format one row.
    pub fn cells<'a>(&'a self, row: &'a [SqlValue]) -> impl Iterator<Item = Cell<'a>> + 'a {
        self.columns.iter().map(move |column| match row.get(column.source) {
            None | Some(SqlValue::Null) => Cell::Empty,
            Some(value) => format_cell(value, column.layout.as_deref()),
        })
    }
}

/// Map the user-facing format tokens to strftime layouts. Anything else is
/// taken as a strftime layout as written.
fn layout_for(token: &str) -> String {
    match token {
        "YYYY-MM-DD" => "%Y-%m-%d",
        "DD/MM/YYYY" => "%d/%m/%Y",
        "MM/DD/YYYY" => "%m/%d/%Y",
        "YYYY-MM-DD HH:mm:ss" => "%Y-%m-%d %H:%M:%S",
        other => other,
    }
    .to_string()
}

fn format_cell<'a>(value: &'a SqlValue, layout: Option<&str>) -> Cell<'a> {
    if let Some(formatted) = layout.and_then(|layout| format_date(value, layout)) {
        return Cell::Text(Cow::Owned(formatted));
    }
    match value {
        SqlValue::Null => Cell::Empty,
        SqlValue::Int(i) => Cell::Int(*i),
        SqlValue::Float(f) => Cell::Number(*f),
        SqlValue::Bool(b) => Cell::Bool(*b),
        other => Cell::Text(other.render()),
    }
}

/// Reformat a temporal value, or text that parses as one. `None` means the
/// caller should fall back to the default rendering.
pub fn format_date(value: &SqlValue, layout: &str) -> Option<String> {
    match value {
        SqlValue::DateTime(dt) => render_layout(dt, layout),
        SqlValue::Date(d) => render_layout(&d.and_hms_opt(0, 0, 0)?, layout),
        SqlValue::Timestamp(ts) => render_offset(ts, layout),
        SqlValue::Text(s) => parse_naive(s).and_then(|dt| render_layout(&dt, layout)),
        SqlValue::Bytes(b) => std::str::from_utf8(b)
            .ok()
            .and_then(parse_naive)
            .and_then(|dt| render_layout(&dt, layout)),
        _ => None,
    }
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DATETIME_LAYOUT)
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, DATE_LAYOUT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

// chrono reports an unusable layout as a fmt::Error at render time.
fn render_layout(dt: &NaiveDateTime, layout: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", dt.format(layout)).ok()?;
    Some(out)
}

fn render_offset(ts: &DateTime<FixedOffset>, layout: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", ts.format(layout)).ok()?;
    Some(out)
}
