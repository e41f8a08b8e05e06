//! SQL Server execution through tiberius.

use crate::db::connection::{ResolvedConnection, CONNECT_TIMEOUT};
use crate::db::cursor::{self, FetchSender, Fetched, OpenQuery, ROW_BUFFER};
use crate::db::value::{BindValue, SqlValue};
use crate::error::{EngineError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use std::borrow::Cow;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

impl ToSql for BindValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            BindValue::Null => ColumnData::String(None),
            BindValue::Bool(b) => ColumnData::Bit(Some(*b)),
            BindValue::Int(i) => ColumnData::I64(Some(*i)),
            BindValue::Float(f) => ColumnData::F64(Some(*f)),
            BindValue::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
        }
    }
}

pub(crate) async fn execute_mssql(
    target: &ResolvedConnection,
    sql: String,
    binds: Vec<BindValue>,
    cancel: CancellationToken,
) -> Result<OpenQuery> {
    let p = &target.params;
    let mut config = Config::new();
    config.host(&p.host);
    config.port(p.port);
    if !p.database.is_empty() {
        config.database(&p.database);
    }
    config.authentication(AuthMethod::sql_server(&p.username, &p.password));
    config.trust_cert();

    let (tx, rx) = mpsc::channel(ROW_BUFFER);
    let producer = tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = run_mssql(config, &sql, &binds, &tx) => outcome,
        };
        if let Err(e) = outcome {
            let _ = tx.send(Err(e)).await;
        }
    });
    cursor::open(rx, producer).await
}

async fn run_mssql(config: Config, sql: &str, binds: &[BindValue], tx: &FetchSender) -> Result<()> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(config.get_addr()))
        .await
        .map_err(|_| connect_timed_out())?
        .map_err(|e| EngineError::Connection(e.to_string()))?;
    tcp.set_nodelay(true)?;

    let mut client = tokio::time::timeout(CONNECT_TIMEOUT, Client::connect(config, tcp.compat_write()))
        .await
        .map_err(|_| connect_timed_out())?
        .map_err(|e| EngineError::Connection(e.to_string()))?;

    let params: Vec<&dyn ToSql> = binds.iter().map(|b| b as &dyn ToSql).collect();
    let result: Result<()> = async {
        let mut stream = client.query(sql, &params).await.map_err(query_error)?;
        let columns = stream
            .columns()
            .await
            .map_err(query_error)?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        if tx.send(Ok(Fetched::Columns(columns))).await.is_err() {
            return Ok(());
        }

        let mut rows = stream.into_row_stream();
        while let Some(row) = rows.try_next().await.map_err(query_error)? {
            let values = row.into_iter().map(|data| decode_mssql(&data)).collect();
            if tx.send(Ok(Fetched::Row(values))).await.is_err() {
                break;
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = client.close().await {
        debug!("Error closing SQL Server connection: {}", e);
    }
    result
}

fn decode_mssql(data: &ColumnData<'static>) -> SqlValue {
    let value = match data {
        ColumnData::U8(v) => v.map(|n| SqlValue::Int(i64::from(n))),
        ColumnData::I16(v) => v.map(|n| SqlValue::Int(i64::from(n))),
        ColumnData::I32(v) => v.map(|n| SqlValue::Int(i64::from(n))),
        ColumnData::I64(v) => v.map(SqlValue::Int),
        ColumnData::F32(v) => v.map(|n| SqlValue::Float(f64::from(n))),
        ColumnData::F64(v) => v.map(SqlValue::Float),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| SqlValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| SqlValue::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| SqlValue::Bytes(b.to_vec())),
        ColumnData::Numeric(_) => Decimal::from_sql(data)
            .ok()
            .flatten()
            .map(|d| SqlValue::Decimal(d.to_string())),
        _ => decode_temporal(data),
    };
    value.unwrap_or(SqlValue::Null)
}

fn decode_temporal(data: &ColumnData<'static>) -> Option<SqlValue> {
    if let Ok(v) = NaiveDateTime::from_sql(data) {
        return v.map(SqlValue::DateTime);
    }
    if let Ok(v) = NaiveDate::from_sql(data) {
        return v.map(SqlValue::Date);
    }
    if let Ok(v) = NaiveTime::from_sql(data) {
        return v.map(SqlValue::Time);
    }
    if let Ok(v) = DateTime::<FixedOffset>::from_sql(data) {
        return v.map(SqlValue::Timestamp);
    }
    Some(SqlValue::Text("<unsupported>".to_string()))
}

fn connect_timed_out() -> EngineError {
    EngineError::Connection(format!(
        "connection timed out after {} seconds",
        CONNECT_TIMEOUT.as_secs()
    ))
}

fn query_error(e: tiberius::error::Error) -> EngineError {
    EngineError::Query(e.to_string())
}
