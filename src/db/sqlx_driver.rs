//! MySQL and PostgreSQL execution through sqlx.

use crate::db::connection::{ResolvedConnection, CONNECT_TIMEOUT};
use crate::db::cursor::{self, FetchSender, Fetched, OpenQuery, ROW_BUFFER};
use crate::db::value::{BindValue, Row, SqlValue};
use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgTypeInfo, Postgres};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, Executor, Row as _, Statement, Type, TypeInfo, ValueRef};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Try each Rust type in turn; the first one sqlx accepts for the column wins.
macro_rules! decode_first {
    ($row:expr, $index:expr, $( $ty:ty => $wrap:expr ),+ $(,)?) => {
        $(
            if let Ok(v) = $row.try_get::<$ty, _>($index) {
                return ($wrap)(v);
            }
        )+
    };
}

pub(crate) async fn execute_postgres(
    target: &ResolvedConnection,
    sql: String,
    binds: Vec<BindValue>,
    cancel: CancellationToken,
) -> Result<OpenQuery> {
    let p = &target.params;
    let mut options = PgConnectOptions::new()
        .host(&p.host)
        .port(p.port)
        .username(&p.username)
        .password(&p.password);
    if !p.database.is_empty() {
        options = options.database(&p.database);
    }

    let (tx, rx) = mpsc::channel(ROW_BUFFER);
    let producer = tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = run_postgres(options, &sql, binds, &tx) => outcome,
        };
        if let Err(e) = outcome {
            let _ = tx.send(Err(e)).await;
        }
    });
    cursor::open(rx, producer).await
}

pub(crate) async fn execute_mysql(
    target: &ResolvedConnection,
    sql: String,
    binds: Vec<BindValue>,
    cancel: CancellationToken,
) -> Result<OpenQuery> {
    let p = &target.params;
    let mut options = MySqlConnectOptions::new()
        .host(&p.host)
        .port(p.port)
        .username(&p.username)
        .password(&p.password);
    if !p.database.is_empty() {
        options = options.database(&p.database);
    }

    let (tx, rx) = mpsc::channel(ROW_BUFFER);
    let producer = tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = run_mysql(options, &sql, binds, &tx) => outcome,
        };
        if let Err(e) = outcome {
            let _ = tx.send(Err(e)).await;
        }
    });
    cursor::open(rx, producer).await
}

async fn run_postgres(
    options: PgConnectOptions,
    sql: &str,
    binds: Vec<BindValue>,
    tx: &FetchSender,
) -> Result<()> {
    let mut conn: PgConnection = tokio::time::timeout(CONNECT_TIMEOUT, options.connect())
        .await
        .map_err(|_| connect_timed_out())?
        .map_err(connection_error)?;

    let result: Result<()> = async {
        // Parameter types match the binds so the prepared statement accepts them.
        let types: Vec<PgTypeInfo> = binds.iter().map(postgres_type).collect();
        let statement = (&mut conn)
            .prepare_with(sql, &types)
            .await
            .map_err(query_error)?;
        let columns = column_names(statement.columns());

        let mut query = statement.query();
        for bind in binds {
            query = bind_postgres(query, bind);
        }
        let rows = query
            .fetch(&mut conn)
            .map_ok(|row: PgRow| -> Row { (0..row.len()).map(|i| decode_postgres(&row, i)).collect() });
        pump(columns, rows, tx).await
    }
    .await;

    if let Err(e) = conn.close().await {
        debug!("Error closing postgres connection: {}", e);
    }
    result
}

async fn run_mysql(
    options: MySqlConnectOptions,
    sql: &str,
    binds: Vec<BindValue>,
    tx: &FetchSender,
) -> Result<()> {
    let mut conn: MySqlConnection = tokio::time::timeout(CONNECT_TIMEOUT, options.connect())
        .await
        .map_err(|_| connect_timed_out())?
        .map_err(connection_error)?;

    let result: Result<()> = async {
        let statement = (&mut conn).prepare(sql).await.map_err(query_error)?;
        let columns = column_names(statement.columns());

        let mut query = statement.query();
        for bind in binds {
            query = bind_mysql(query, bind);
        }
        let rows = query
            .fetch(&mut conn)
            .map_ok(|row: MySqlRow| -> Row { (0..row.len()).map(|i| decode_mysql(&row, i)).collect() });
        pump(columns, rows, tx).await
    }
    .await;

    if let Err(e) = conn.close().await {
        debug!("Error closing mysql connection: {}", e);
    }
    result
}

/// Send the prepared statement's columns, then forward decoded rows to the
/// cursor until the result set ends or the cursor is dropped.
async fn pump<S>(columns: Vec<String>, rows: S, tx: &FetchSender) -> Result<()>
where
    S: futures_util::Stream<Item = std::result::Result<Row, sqlx::Error>>,
{
    if tx.send(Ok(Fetched::Columns(columns))).await.is_err() {
        return Ok(());
    }
    futures_util::pin_mut!(rows);
    while let Some(values) = rows.try_next().await.map_err(query_error)? {
        if tx.send(Ok(Fetched::Row(values))).await.is_err() {
            // Cursor dropped; stop reading.
            return Ok(());
        }
    }
    Ok(())
}

fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

fn postgres_type(value: &BindValue) -> PgTypeInfo {
    match value {
        BindValue::Null | BindValue::Text(_) => <String as Type<Postgres>>::type_info(),
        BindValue::Bool(_) => <bool as Type<Postgres>>::type_info(),
        BindValue::Int(_) => <i64 as Type<Postgres>>::type_info(),
        BindValue::Float(_) => <f64 as Type<Postgres>>::type_info(),
    }
}

fn bind_postgres(
    query: Query<'_, Postgres, PgArguments>,
    value: BindValue,
) -> Query<'_, Postgres, PgArguments> {
    match value {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Bool(b) => query.bind(b),
        BindValue::Int(i) => query.bind(i),
        BindValue::Float(f) => query.bind(f),
        BindValue::Text(s) => query.bind(s),
    }
}

fn bind_mysql(
    query: Query<'_, MySql, MySqlArguments>,
    value: BindValue,
) -> Query<'_, MySql, MySqlArguments> {
    match value {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Bool(b) => query.bind(b),
        BindValue::Int(i) => query.bind(i),
        BindValue::Float(f) => query.bind(f),
        BindValue::Text(s) => query.bind(s),
    }
}

fn decode_postgres(row: &PgRow, index: usize) -> SqlValue {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return SqlValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return SqlValue::Null,
    };

    decode_first!(row, index,
        bool => SqlValue::Bool,
        i16 => |v: i16| SqlValue::Int(i64::from(v)),
        i32 => |v: i32| SqlValue::Int(i64::from(v)),
        i64 => SqlValue::Int,
        f32 => |v: f32| SqlValue::Float(f64::from(v)),
        f64 => SqlValue::Float,
        Decimal => |v: Decimal| SqlValue::Decimal(v.to_string()),
        String => SqlValue::Text,
        NaiveDateTime => SqlValue::DateTime,
        DateTime<Utc> => |v: DateTime<Utc>| SqlValue::Timestamp(v.fixed_offset()),
        NaiveDate => SqlValue::Date,
        NaiveTime => SqlValue::Time,
        uuid::Uuid => |v: uuid::Uuid| SqlValue::Text(v.to_string()),
        serde_json::Value => |v: serde_json::Value| SqlValue::Text(v.to_string()),
        Vec<u8> => SqlValue::Bytes,
    );
    SqlValue::Text(format!("<{type_name}>"))
}

fn decode_mysql(row: &MySqlRow, index: usize) -> SqlValue {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return SqlValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return SqlValue::Null,
    };

    decode_first!(row, index,
        i64 => SqlValue::Int,
        u64 => |v: u64| i64::try_from(v)
            .map(SqlValue::Int)
            .unwrap_or_else(|_| SqlValue::Decimal(v.to_string())),
        f64 => SqlValue::Float,
        f32 => |v: f32| SqlValue::Float(f64::from(v)),
        Decimal => |v: Decimal| SqlValue::Decimal(v.to_string()),
        NaiveDateTime => SqlValue::DateTime,
        DateTime<Utc> => |v: DateTime<Utc>| SqlValue::Timestamp(v.fixed_offset()),
        NaiveDate => SqlValue::Date,
        NaiveTime => SqlValue::Time,
        String => SqlValue::Text,
        Vec<u8> => SqlValue::Bytes,
        serde_json::Value => |v: serde_json::Value| SqlValue::Text(v.to_string()),
        bool => SqlValue::Bool,
    );
    SqlValue::Text(format!("<{type_name}>"))
}

fn connect_timed_out() -> EngineError {
    EngineError::Connection(format!(
        "connection timed out after {} seconds",
        CONNECT_TIMEOUT.as_secs()
    ))
}

fn connection_error(e: sqlx::Error) -> EngineError {
    EngineError::Connection(e.to_string())
}

fn query_error(e: sqlx::Error) -> EngineError {
    EngineError::Query(e.to_string())
}
