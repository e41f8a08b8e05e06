//! Oracle execution through the `oracle` crate (ODPI-C).
//!
//! The driver is synchronous, so the whole session lives on a blocking
//! thread and rows cross over with `blocking_send`. A watcher task on the
//! runtime breaks the in-flight call when the job is cancelled, since a
//! blocking thread cannot be aborted.

use crate::db::connection::ResolvedConnection;
use crate::db::cursor::{self, FetchSender, Fetched, OpenQuery, ROW_BUFFER};
use crate::db::value::{BindValue, SqlValue};
use crate::error::{EngineError, Result};
use ::oracle::sql_type::{FromSql, OracleType, ToSql};
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn execute_oracle(
    target: &ResolvedConnection,
    sql: String,
    binds: Vec<BindValue>,
    cancel: CancellationToken,
) -> Result<OpenQuery> {
    let login = Login {
        username: target.params.username.clone(),
        password: target.params.password.clone(),
        connect_string: target.oracle_connect_string(),
    };

    let (tx, rx) = mpsc::channel(ROW_BUFFER);
    let runtime = Handle::current();
    let producer = tokio::task::spawn_blocking(move || {
        let outcome = run_oracle(&runtime, &login, &sql, &binds, &tx, &cancel);
        if let Err(e) = outcome {
            let _ = tx.blocking_send(Err(e));
        }
    });
    cursor::open(rx, producer).await
}

struct Login {
    username: String,
    password: String,
    connect_string: String,
}

fn run_oracle(
    runtime: &Handle,
    login: &Login,
    sql: &str,
    binds: &[BindValue],
    tx: &FetchSender,
    cancel: &CancellationToken,
) -> Result<()> {
    let conn = ::oracle::Connection::connect(&login.username, &login.password, &login.connect_string)
        .map_err(|e| EngineError::Connection(e.to_string()))?;
    let conn = Arc::new(conn);
    let watcher = interrupt_on_cancel(runtime, Arc::clone(&conn), cancel.clone());

    let owned: Vec<Box<dyn ToSql>> = binds.iter().map(to_oracle_bind).collect();
    let params: Vec<&dyn ToSql> = owned.iter().map(|b| b.as_ref()).collect();

    let result = (|| {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let rows = conn.query(sql, &params).map_err(query_error)?;
        let (columns, types): (Vec<String>, Vec<OracleType>) = rows
            .column_info()
            .iter()
            .map(|info| (info.name().to_string(), info.oracle_type().clone()))
            .unzip();
        if tx.blocking_send(Ok(Fetched::Columns(columns))).is_err() {
            return Ok(());
        }

        for row in rows {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let row = row.map_err(query_error)?;
            let values = types
                .iter()
                .enumerate()
                .map(|(i, ty)| decode_oracle(&row, i, ty))
                .collect();
            if tx.blocking_send(Ok(Fetched::Row(values))).is_err() {
                break;
            }
        }
        Ok(())
    })();
    watcher.abort();
    // A broken call surfaces as a driver error; report the cancellation.
    let result = result.map_err(|e| if cancel.is_cancelled() { EngineError::Cancelled } else { e });

    if let Err(e) = conn.close() {
        debug!("Error closing oracle connection: {}", e);
    }
    result
}

/// A session whose in-flight call can be broken from another thread.
trait Interruptible: Send + Sync + 'static {
    fn interrupt(&self) -> Result<()>;
}

impl Interruptible for ::oracle::Connection {
    fn interrupt(&self) -> Result<()> {
        self.break_execution().map_err(query_error)
    }
}

/// Interrupt `session` once `cancel` fires. Abort the returned task when the
/// session's work is done.
fn interrupt_on_cancel<S: Interruptible>(
    runtime: &Handle,
    session: Arc<S>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        cancel.cancelled().await;
        debug!("Breaking in-flight oracle call");
        if let Err(e) = session.interrupt() {
            debug!("Failed to break oracle call: {}", e);
        }
    })
}

fn to_oracle_bind(value: &BindValue) -> Box<dyn ToSql> {
    match value {
        BindValue::Null => Box::new(None::<String>),
        // No SQL boolean before 23c; bind as 1/0.
        BindValue::Bool(b) => Box::new(i64::from(*b)),
        BindValue::Int(i) => Box::new(*i),
        BindValue::Float(f) => Box::new(*f),
        BindValue::Text(s) => Box::new(s.clone()),
    }
}

fn decode_oracle(row: &::oracle::Row, index: usize, ty: &OracleType) -> SqlValue {
    let decoded = match ty {
        OracleType::Number(precision, 0) if (1..=18).contains(precision) => {
            get::<i64>(row, index).map(|v| v.map(SqlValue::Int))
        }
        OracleType::Int64 => get::<i64>(row, index).map(|v| v.map(SqlValue::Int)),
        OracleType::Number(..) | OracleType::Float(_) => {
            get::<String>(row, index).map(|v| v.map(SqlValue::Decimal))
        }
        OracleType::BinaryFloat | OracleType::BinaryDouble => {
            get::<f64>(row, index).map(|v| v.map(SqlValue::Float))
        }
        OracleType::Date | OracleType::Timestamp(_) => {
            get::<NaiveDateTime>(row, index).map(|v| v.map(SqlValue::DateTime))
        }
        OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => {
            get::<DateTime<FixedOffset>>(row, index).map(|v| v.map(SqlValue::Timestamp))
        }
        OracleType::Raw(_) | OracleType::BLOB | OracleType::LongRaw => {
            get::<Vec<u8>>(row, index).map(|v| v.map(SqlValue::Bytes))
        }
        OracleType::Boolean => get::<bool>(row, index).map(|v| v.map(SqlValue::Bool)),
        _ => None,
    };

    match decoded {
        Some(value) => value.unwrap_or(SqlValue::Null),
        None => get::<String>(row, index)
            .flatten()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null),
    }
}

/// `None` when the column cannot be read as `T`; `Some(None)` for SQL NULL.
fn get<T: FromSql>(row: &::oracle::Row, index: usize) -> Option<Option<T>> {
    row.get::<usize, Option<T>>(index).ok()
}

fn query_error(e: ::oracle::Error) -> EngineError {
    EngineError::Query(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    /// Stands in for a statement that only returns when broken.
    #[derive(Default)]
    struct Stuck {
        broken: AtomicBool,
    }

    impl Stuck {
        fn run(&self, limit: Duration) -> bool {
            let started = Instant::now();
            while started.elapsed() < limit {
                if self.broken.load(Ordering::SeqCst) {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    impl Interruptible for Stuck {
        fn interrupt(&self) -> Result<()> {
            self.broken.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_breaks_blocking_call() {
        let session = Arc::new(Stuck::default());
        let cancel = CancellationToken::new();
        let watcher = interrupt_on_cancel(&Handle::current(), Arc::clone(&session), cancel.clone());

        let call = {
            let session = Arc::clone(&session);
            tokio::task::spawn_blocking(move || session.run(Duration::from_secs(10)))
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let broken = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("blocking call should return once broken")
            .unwrap();
        assert!(broken);
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_work_is_not_interrupted() {
        let session = Arc::new(Stuck::default());
        let cancel = CancellationToken::new();
        let watcher = interrupt_on_cancel(&Handle::current(), Arc::clone(&session), cancel.clone());

        watcher.abort();
        assert!(watcher.await.unwrap_err().is_cancelled());
        cancel.cancel();
        tokio::task::yield_now().await;
        assert!(!session.broken.load(Ordering::SeqCst));
    }
}
