//! Query Engine
//!
//! Resolves a report's data source to a driver, translates and binds the
//! query, and hands back a forward-only cursor plus the session it reads
//! from. Nothing is materialized here; rows are pulled by the encoder.

pub mod connection;
pub mod cursor;
mod mssql;
mod oracle_driver;
mod sqlx_driver;
pub mod value;

pub use connection::{resolve_connection, ConnectionParams, ResolvedConnection};
pub use cursor::{Connection, Cursor, OpenQuery};
pub use value::{bindings_from_json, BindValue, Row, SqlValue};

use crate::dialect::{translate_placeholders, EngineKind};
use crate::error::{EngineError, Result};
use crate::models::{Job, Report};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Executes a report's query and returns an open cursor.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// The caller owns the result and must close it on every path.
    /// Cancelling `cancel` stops the driver at its next row.
    async fn execute(&self, report: &Report, job: &Job, cancel: CancellationToken)
        -> Result<OpenQuery>;
}

/// The query text for a job: the job's override first, then the report's
/// stored definition.
pub fn query_text<'a>(report: &'a Report, job: &'a Job) -> Result<&'a str> {
    if let Some(sql) = job.sql_override() {
        return Ok(sql);
    }
    if report.sql_definition.trim().is_empty() {
        return Err(EngineError::Query("report SQL definition is empty".to_string()));
    }
    Ok(&report.sql_definition)
}

/// Executor backed by the live database drivers.
#[derive(Debug, Default, Clone)]
pub struct SqlQueryExecutor;

impl SqlQueryExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryExecutor for SqlQueryExecutor {
    async fn execute(
        &self,
        report: &Report,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<OpenQuery> {
        let target = resolve_connection(&report.data_source)?;
        let sql = translate_placeholders(query_text(report, job)?, target.engine);
        let binds = bindings_from_json(&job.bindings);

        info!(
            "Executing report {} on {} with {} binding(s)",
            report.id,
            target.display_target(),
            binds.len()
        );

        match target.engine {
            EngineKind::Mysql => sqlx_driver::execute_mysql(&target, sql, binds, cancel).await,
            EngineKind::Postgres => {
                sqlx_driver::execute_postgres(&target, sql, binds, cancel).await
            }
            EngineKind::Mssql => mssql::execute_mssql(&target, sql, binds, cancel).await,
            EngineKind::Oracle => oracle_driver::execute_oracle(&target, sql, binds, cancel).await,
        }
    }
}
