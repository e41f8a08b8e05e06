//! Forward-only cursors backed by a driver producer task.
//!
//! Each driver runs its statement on a task that owns the database session
//! and pushes rows into a bounded channel. The [`Cursor`] is the receiving
//! end; the [`Connection`] is the handle on the producer. Dropping the cursor
//! stops the producer at its next send, after which closing the connection
//! waits for the session to shut down.

use crate::db::value::Row;
use crate::error::{EngineError, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Rows buffered between the driver and the encoder.
pub const ROW_BUFFER: usize = 256;

/// How long closing a connection waits for the driver to finish.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Messages sent by a driver producer.
#[derive(Debug)]
pub(crate) enum Fetched {
    /// Always sent first, once.
    Columns(Vec<String>),
    Row(Row),
}

pub(crate) type FetchSender = mpsc::Sender<Result<Fetched>>;

pub struct Cursor {
    columns: Vec<String>,
    rows: mpsc::Receiver<Result<Fetched>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("columns", &self.columns).finish()
    }
}

impl Cursor {
    /// Column names in the query's native order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Next row, or `None` once the result set is exhausted.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        flatten(self.rows.recv().await)
    }

    /// Blocking variant for encoders running on a blocking thread.
    pub fn blocking_next_row(&mut self) -> Result<Option<Row>> {
        flatten(self.rows.blocking_recv())
    }

    /// Build a cursor over rows that are already in memory.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self::from_results(columns, rows.into_iter().map(Ok).collect())
    }

    /// Like [`Cursor::from_rows`], but individual rows may be scan failures.
    pub fn from_results(columns: Vec<String>, rows: Vec<Result<Row>>) -> Self {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            // Capacity covers every row, so this never fails.
            let _ = tx.try_send(row.map(Fetched::Row));
        }
        Self { columns, rows: rx }
    }
}

fn flatten(message: Option<Result<Fetched>>) -> Result<Option<Row>> {
    match message {
        None => Ok(None),
        Some(Ok(Fetched::Row(row))) => Ok(Some(row)),
        Some(Ok(Fetched::Columns(_))) => Err(EngineError::Encoding(
            "driver sent column metadata twice".to_string(),
        )),
        Some(Err(e)) => Err(e),
    }
}

/// Handle on the producer that owns the database session.
#[derive(Debug, Default)]
pub struct Connection {
    producer: Option<JoinHandle<()>>,
}

impl Connection {
    /// A connection with nothing to close.
    pub fn detached() -> Self {
        Self { producer: None }
    }

    /// Wait for the session to close. Call after the cursor is dropped.
    pub async fn close(mut self) {
        let Some(mut producer) = self.producer.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_GRACE, &mut producer).await {
            Ok(Ok(())) => debug!("Database session closed"),
            Ok(Err(e)) if e.is_panic() => warn!("Database producer panicked while closing"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Database session did not close within {:?}; aborting", CLOSE_GRACE);
                producer.abort();
            }
        }
    }
}

/// An executing statement: the cursor plus the session it reads from.
/// Close in cursor-then-connection order.
#[derive(Debug)]
pub struct OpenQuery {
    pub cursor: Cursor,
    pub connection: Connection,
}

impl OpenQuery {
    /// An open query over in-memory rows, with no session behind it.
    pub fn in_memory(cursor: Cursor) -> Self {
        Self {
            cursor,
            connection: Connection::detached(),
        }
    }

    pub async fn close(self) {
        drop(self.cursor);
        self.connection.close().await;
    }
}

/// Wait for the producer's column metadata and assemble the open query.
///
/// Errors raised before the first message (connect, prepare, execute) are
/// returned here rather than from the cursor.
pub(crate) async fn open(
    mut rows: mpsc::Receiver<Result<Fetched>>,
    producer: JoinHandle<()>,
) -> Result<OpenQuery> {
    let connection = Connection {
        producer: Some(producer),
    };
    let first = rows.recv().await;
    match first {
        Some(Ok(Fetched::Columns(columns))) => Ok(OpenQuery {
            cursor: Cursor { columns, rows },
            connection,
        }),
        Some(Ok(Fetched::Row(_))) => {
            drop(rows);
            connection.close().await;
            Err(EngineError::Query(
                "driver sent a row before column metadata".to_string(),
            ))
        }
        Some(Err(e)) => {
            connection.close().await;
            Err(e)
        }
        None => {
            connection.close().await;
            Err(EngineError::Cancelled)
        }
    }
}
